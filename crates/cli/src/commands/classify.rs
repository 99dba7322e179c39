use serde::Serialize;
use sprout_agent::intent::{requires_tools, ClassifierConfig, IntentClassifier};
use sprout_core::domain::intent::IntentAnalysis;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct Classification {
    query: String,
    requires_tools: bool,
    analysis: IntentAnalysis,
}

/// Rule-based classification only; the model-assisted path needs a running provider.
pub fn run(query: &str) -> CommandResult {
    if query.trim().is_empty() {
        return CommandResult::failure("classify", "invalid_input", "query must not be empty", 2);
    }

    let analysis = IntentClassifier::new(ClassifierConfig::default()).classify_rules(query);
    CommandResult::data(
        "classify",
        Classification {
            query: query.to_string(),
            requires_tools: requires_tools(&analysis),
            analysis,
        },
    )
}
