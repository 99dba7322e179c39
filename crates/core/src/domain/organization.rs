use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ApplicationError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationStats {
    pub tenant_id: String,
    pub student_count: u64,
    pub teacher_count: u64,
    pub class_count: u64,
    pub pending_enrollments: u64,
    pub active_activities: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl OrganizationStats {
    pub fn empty(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            student_count: 0,
            teacher_count: 0,
            class_count: 0,
            pending_enrollments: 0,
            active_activities: 0,
            refreshed_at: Utc::now(),
        }
    }
}

/// Source of record for the aggregate statistics shown in system prompts.
#[async_trait]
pub trait OrganizationStatsSource: Send + Sync {
    async fn load_stats(&self, tenant_id: &str) -> Result<OrganizationStats, ApplicationError>;
}

/// Business data category named by a "data changed" signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Student,
    Teacher,
    Class,
    Enrollment,
    Activity,
    Other,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Class => "class",
            Self::Enrollment => "enrollment",
            Self::Activity => "activity",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "student" | "students" => Some(Self::Student),
            "teacher" | "teachers" => Some(Self::Teacher),
            "class" | "classes" => Some(Self::Class),
            "enrollment" | "enrollments" => Some(Self::Enrollment),
            "activity" | "activities" => Some(Self::Activity),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Core entity changes can alter which tools are worth choosing.
    pub fn affects_decision_tree(&self) -> bool {
        matches!(self, Self::Student | Self::Teacher | Self::Class)
    }
}
