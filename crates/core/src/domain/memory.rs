use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ApplicationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryDimension {
    Core,
    Episodic,
    Semantic,
    Procedural,
    Resource,
    Knowledge,
}

impl MemoryDimension {
    /// The six canonical dimensions, in prompt order.
    pub const ALL: [MemoryDimension; 6] = [
        Self::Core,
        Self::Episodic,
        Self::Semantic,
        Self::Procedural,
        Self::Resource,
        Self::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Resource => "resource",
            Self::Knowledge => "knowledge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "core" => Some(Self::Core),
            "episodic" => Some(Self::Episodic),
            "semantic" => Some(Self::Semantic),
            "procedural" => Some(Self::Procedural),
            "resource" => Some(Self::Resource),
            "knowledge" => Some(Self::Knowledge),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Core => "Core memory",
            Self::Episodic => "Recent conversations",
            Self::Semantic => "Related concepts",
            Self::Procedural => "Known procedures",
            Self::Resource => "Resources",
            Self::Knowledge => "Knowledge base",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub dimension: MemoryDimension,
    pub content: String,
    pub relevance: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Read side of the memory system. The runtime never writes memories.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn retrieve_by_dimension(
        &self,
        dimension: MemoryDimension,
        query: &str,
        user_id: &str,
    ) -> Result<Vec<MemoryItem>, ApplicationError>;
}

#[cfg(test)]
mod tests {
    use super::MemoryDimension;

    #[test]
    fn dimension_round_trips_from_storage_encoding() {
        for dimension in MemoryDimension::ALL {
            assert_eq!(MemoryDimension::parse(dimension.as_str()), Some(dimension));
        }
    }
}
