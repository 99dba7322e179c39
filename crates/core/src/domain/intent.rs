use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Navigation,
    Query,
    Operation,
    Analysis,
    Creation,
    Modification,
    Deletion,
    Conversation,
    Unknown,
}

impl IntentType {
    pub const ALL: [IntentType; 9] = [
        Self::Navigation,
        Self::Query,
        Self::Operation,
        Self::Analysis,
        Self::Creation,
        Self::Modification,
        Self::Deletion,
        Self::Conversation,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Query => "query",
            Self::Operation => "operation",
            Self::Analysis => "analysis",
            Self::Creation => "creation",
            Self::Modification => "modification",
            Self::Deletion => "deletion",
            Self::Conversation => "conversation",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigation" => Some(Self::Navigation),
            "query" => Some(Self::Query),
            "operation" => Some(Self::Operation),
            "analysis" => Some(Self::Analysis),
            "creation" => Some(Self::Creation),
            "modification" => Some(Self::Modification),
            "deletion" => Some(Self::Deletion),
            "conversation" => Some(Self::Conversation),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Starting weight of the complexity score for this intent.
    pub fn base_weight(&self) -> u32 {
        match self {
            Self::Conversation | Self::Unknown => 0,
            Self::Navigation => 1,
            Self::Query | Self::Deletion => 2,
            Self::Creation | Self::Modification | Self::Operation => 2,
            Self::Analysis => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "moderate" => Some(Self::Moderate),
            "complex" => Some(Self::Complex),
            _ => None,
        }
    }
}

/// Functional requirement of a turn; each maps onto one or more tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DatabaseQuery,
    DataAnalysis,
    ChartGeneration,
    FileOperation,
    Calculation,
    TextGeneration,
    WebSearch,
    UiRendering,
    Navigation,
    Workflow,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Self::DatabaseQuery,
        Self::DataAnalysis,
        Self::ChartGeneration,
        Self::FileOperation,
        Self::Calculation,
        Self::TextGeneration,
        Self::WebSearch,
        Self::UiRendering,
        Self::Navigation,
        Self::Workflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseQuery => "database_query",
            Self::DataAnalysis => "data_analysis",
            Self::ChartGeneration => "chart_generation",
            Self::FileOperation => "file_operation",
            Self::Calculation => "calculation",
            Self::TextGeneration => "text_generation",
            Self::WebSearch => "web_search",
            Self::UiRendering => "ui_rendering",
            Self::Navigation => "navigation",
            Self::Workflow => "workflow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|capability| capability.as_str() == normalized)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Rules,
    Model,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: IntentType,
    pub complexity: Complexity,
    pub required_capabilities: BTreeSet<Capability>,
    pub confidence: f64,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    pub cache_hit: bool,
    pub source: AnalysisSource,
}

impl IntentAnalysis {
    pub fn requires(&self, capability: Capability) -> bool {
        self.required_capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, Complexity, IntentType};

    #[test]
    fn intent_type_round_trips_from_wire_encoding() {
        for intent in IntentType::ALL {
            assert_eq!(IntentType::parse(intent.as_str()), Some(intent));
        }
        assert_eq!(IntentType::parse("greeting"), None);
    }

    #[test]
    fn capability_parse_accepts_kebab_case() {
        assert_eq!(Capability::parse("chart-generation"), Some(Capability::ChartGeneration));
        assert_eq!(Capability::parse(" DATABASE_QUERY "), Some(Capability::DatabaseQuery));
        assert_eq!(Capability::parse("teleport"), None);
    }

    #[test]
    fn complexity_orders_by_tier() {
        assert!(Complexity::Simple < Complexity::Moderate);
        assert!(Complexity::Moderate < Complexity::Complex);
    }
}
