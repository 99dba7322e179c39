use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sprout_core::domain::memory::{MemoryDimension, MemoryItem, MemoryStore};
use sprout_core::errors::ApplicationError;
use sqlx::{sqlite::SqliteRow, Row};

use super::RepositoryError;
use crate::DbPool;

const DEFAULT_FETCH_LIMIT: i64 = 50;

/// Read side of the six-dimension memory tables.
///
/// Rows whose content contains the query verbatim sort first, then by stored
/// relevance. Relevance itself is owned by the memory writer and returned as-is.
pub struct SqlMemoryStore {
    pool: DbPool,
    fetch_limit: i64,
}

impl SqlMemoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, fetch_limit: DEFAULT_FETCH_LIMIT }
    }

    pub fn with_fetch_limit(mut self, fetch_limit: usize) -> Self {
        self.fetch_limit = i64::try_from(fetch_limit.max(1)).unwrap_or(DEFAULT_FETCH_LIMIT);
        self
    }

    pub async fn list(
        &self,
        dimension: MemoryDimension,
        query: &str,
        user_id: &str,
    ) -> Result<Vec<MemoryItem>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, dimension, content, relevance, metadata_json, created_at
            FROM memory_item
            WHERE user_id = ? AND dimension = ?
            ORDER BY (? <> '' AND instr(content, ?) > 0) DESC, relevance DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(dimension.as_str())
        .bind(query)
        .bind(query)
        .bind(self.fetch_limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    /// Writes one item. Used by seeding and tests; the live memory writer owns
    /// this table in production.
    pub async fn insert(&self, user_id: &str, item: &MemoryItem) -> Result<(), RepositoryError> {
        let metadata = serde_json::to_string(&item.metadata)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO memory_item (id, user_id, dimension, content, relevance, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(user_id)
        .bind(item.dimension.as_str())
        .bind(&item.content)
        .bind(item.relevance)
        .bind(metadata)
        .bind(item.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for SqlMemoryStore {
    async fn retrieve_by_dimension(
        &self,
        dimension: MemoryDimension,
        query: &str,
        user_id: &str,
    ) -> Result<Vec<MemoryItem>, ApplicationError> {
        Ok(self.list(dimension, query, user_id).await?)
    }
}

fn row_to_item(row: &SqliteRow) -> Result<MemoryItem, RepositoryError> {
    let dimension: String = row.try_get("dimension")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let created_at: String = row.try_get("created_at")?;

    let dimension = MemoryDimension::parse(&dimension)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown memory dimension `{dimension}`")))?;
    let metadata: BTreeMap<String, Value> = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid `metadata_json`: {error}")))?;

    Ok(MemoryItem {
        id: row.try_get("id")?,
        dimension,
        content: row.try_get("content")?,
        relevance: row.try_get("relevance")?,
        timestamp: parse_timestamp("created_at", created_at)?,
        metadata,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {e}")))
}
