use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sprout_agent::intent::{requires_tools, ClassifierConfig, IntentClassifier};
use sprout_agent::orchestrator::{CapabilityRoute, CapabilityTable, ToolOrchestrator};
use sprout_agent::tools::{Tool, ToolError, ToolExecutor, ToolRegistry};
use sprout_core::domain::intent::{Capability, IntentType};
use sprout_core::domain::tool::ToolSpec;

use crate::commands::CommandResult;

/// Stands in for a routed tool so a plan can be computed without a database.
struct PlanOnlyTool {
    name: String,
}

#[async_trait]
impl Tool for PlanOnlyTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(self.name.clone(), "offline planning placeholder")
    }

    async fn execute(&self, _input: Value) -> Result<Value, ToolError> {
        Err(ToolError::Failed("offline plans are not executable".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct PlannedStep {
    position: usize,
    tool: String,
    capabilities: Vec<Capability>,
}

#[derive(Debug, Serialize)]
struct Plan {
    query: String,
    intent: IntentType,
    requires_tools: bool,
    multi_round: bool,
    steps: Vec<PlannedStep>,
}

pub fn run(query: &str) -> CommandResult {
    if query.trim().is_empty() {
        return CommandResult::failure("plan", "invalid_input", "query must not be empty", 2);
    }

    let table = CapabilityTable::default();
    let orchestrator = offline_orchestrator(&table);
    let analysis = IntentClassifier::new(ClassifierConfig::default()).classify_rules(query);
    let needs_tools = requires_tools(&analysis);

    let (steps, multi_round) = if needs_tools {
        let plan = orchestrator.plan(&analysis);
        let steps = plan
            .tools()
            .iter()
            .enumerate()
            .map(|(index, tool)| PlannedStep {
                position: index + 1,
                tool: tool.clone(),
                capabilities: routed_capabilities(table.routes(), tool),
            })
            .collect();
        (steps, plan.multi_round())
    } else {
        (Vec::new(), false)
    };

    CommandResult::data(
        "plan",
        Plan {
            query: query.to_string(),
            intent: analysis.intent,
            requires_tools: needs_tools,
            multi_round,
            steps,
        },
    )
}

fn offline_orchestrator(table: &CapabilityTable) -> ToolOrchestrator {
    let mut registry = ToolRegistry::new();
    for name in table.tool_names() {
        registry.register(Arc::new(PlanOnlyTool { name: name.to_string() }));
    }
    ToolOrchestrator::new(registry, table.clone(), ToolExecutor::default())
}

fn routed_capabilities(routes: &[CapabilityRoute], tool: &str) -> Vec<Capability> {
    routes
        .iter()
        .filter(|route| route.tools.iter().any(|routed| routed == tool))
        .map(|route| route.capability)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::run;

    #[test]
    fn chart_request_plans_fetch_before_presentation() {
        let result = run("查询所有学生人数并生成图表");
        assert_eq!(result.exit_code, 0);

        let payload: Value = serde_json::from_str(&result.output).expect("json output");
        let tools: Vec<&str> = payload["steps"]
            .as_array()
            .expect("steps")
            .iter()
            .filter_map(|step| step["tool"].as_str())
            .collect();

        assert_eq!(payload["requires_tools"], true);
        assert_eq!(tools.first(), Some(&"any_query"));
        assert!(tools.contains(&"render_chart"));
    }

    #[test]
    fn greeting_needs_no_plan() {
        let result = run("你好");

        let payload: Value = serde_json::from_str(&result.output).expect("json output");
        assert_eq!(payload["requires_tools"], false);
        assert_eq!(payload["steps"], Value::Array(Vec::new()));
    }
}
