use async_trait::async_trait;
use chrono::Utc;
use sprout_core::domain::organization::{OrganizationStats, OrganizationStatsSource};
use sprout_core::errors::ApplicationError;
use sqlx::Row;

use super::RepositoryError;
use crate::DbPool;

/// Headline counts for one kindergarten, read straight from the source tables.
pub struct SqlOrganizationStatsSource {
    pool: DbPool,
}

impl SqlOrganizationStatsSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, tenant_id: &str) -> Result<OrganizationStats, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM student
                    WHERE tenant_id = ?1 AND status = 'enrolled') AS student_count,
                (SELECT COUNT(*) FROM teacher
                    WHERE tenant_id = ?1 AND status = 'active') AS teacher_count,
                (SELECT COUNT(*) FROM class WHERE tenant_id = ?1) AS class_count,
                (SELECT COUNT(*) FROM enrollment_application
                    WHERE tenant_id = ?1 AND status = 'pending') AS pending_enrollments,
                (SELECT COUNT(*) FROM activity
                    WHERE tenant_id = ?1 AND status = 'active') AS active_activities
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(OrganizationStats {
            tenant_id: tenant_id.to_string(),
            student_count: count(row.try_get("student_count")?),
            teacher_count: count(row.try_get("teacher_count")?),
            class_count: count(row.try_get("class_count")?),
            pending_enrollments: count(row.try_get("pending_enrollments")?),
            active_activities: count(row.try_get("active_activities")?),
            refreshed_at: Utc::now(),
        })
    }
}

#[async_trait]
impl OrganizationStatsSource for SqlOrganizationStatsSource {
    async fn load_stats(&self, tenant_id: &str) -> Result<OrganizationStats, ApplicationError> {
        Ok(self.fetch(tenant_id).await?)
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
