use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sprout_core::domain::chat::ToolCall;
use sprout_core::domain::intent::{Capability, Complexity, IntentAnalysis};
use sprout_core::domain::tool::{ExecutionPlan, ToolExecutionResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tools::{Tool, ToolError, ToolExecutor, ToolMetrics, ToolRegistry};

/// Position of a tool in a plan: data is fetched before it is analysed, and
/// analysed before it is rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Analyze,
    Present,
    /// Ordered by registration rather than by table position.
    Unranked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapabilityRoute {
    pub capability: Capability,
    pub phase: Phase,
    pub tools: Vec<String>,
}

impl CapabilityRoute {
    pub fn new(capability: Capability, phase: Phase, tools: &[&str]) -> Self {
        Self { capability, phase, tools: tools.iter().map(|tool| tool.to_string()).collect() }
    }
}

/// Capability to tool routing. Text generation has no route: the model
/// answers it directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapabilityTable {
    routes: Vec<CapabilityRoute>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new(vec![
            CapabilityRoute::new(Capability::DatabaseQuery, Phase::Fetch, &["any_query"]),
            CapabilityRoute::new(Capability::WebSearch, Phase::Fetch, &["web_search"]),
            CapabilityRoute::new(Capability::DataAnalysis, Phase::Analyze, &["analyze_data"]),
            CapabilityRoute::new(Capability::Calculation, Phase::Analyze, &["calculate"]),
            CapabilityRoute::new(Capability::ChartGeneration, Phase::Present, &["render_chart"]),
            CapabilityRoute::new(Capability::UiRendering, Phase::Present, &["render_component"]),
            CapabilityRoute::new(Capability::FileOperation, Phase::Present, &["generate_document"]),
            CapabilityRoute::new(Capability::Navigation, Phase::Present, &["navigate_to_page"]),
            CapabilityRoute::new(
                Capability::Workflow,
                Phase::Unranked,
                &["execute_activity_workflow"],
            ),
        ])
    }
}

impl CapabilityTable {
    pub fn new(routes: Vec<CapabilityRoute>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[CapabilityRoute] {
        &self.routes
    }

    pub fn tools_for(&self, capability: Capability) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|route| route.capability == capability)
            .flat_map(|route| route.tools.iter().map(String::as_str))
            .collect()
    }

    pub fn tool_names(&self) -> BTreeSet<&str> {
        self.routes.iter().flat_map(|route| route.tools.iter().map(String::as_str)).collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("capability table names unregistered tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    /// Not supported; a parallel request is logged and run serially.
    pub parallel: bool,
    pub stop_on_error: bool,
    pub cancel: Option<CancellationToken>,
}

/// Results of one serial run.
#[derive(Clone, Debug, Default)]
pub struct ExecutionReport {
    pub results: Vec<ToolExecutionResult>,
    /// Tool whose failure stopped the remaining steps.
    pub halted_by: Option<Halt>,
    /// The run was abandoned on cancellation, possibly mid-tool.
    pub cancelled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Halt {
    pub tool: String,
    pub critical: bool,
    pub error: String,
}

impl ExecutionReport {
    pub fn critical_halt(&self) -> Option<&Halt> {
        self.halted_by.as_ref().filter(|halt| halt.critical)
    }
}

/// Receives progress while a plan runs.
#[async_trait]
pub trait ToolObserver: Send + Sync {
    async fn on_tool_start(&self, _tool_name: &str, _index: usize, _total: usize) {}
    async fn on_tool_finish(&self, _result: &ToolExecutionResult) {}
}

pub struct NoopToolObserver;

#[async_trait]
impl ToolObserver for NoopToolObserver {}

pub struct ToolOrchestrator {
    registry: ToolRegistry,
    table: CapabilityTable,
    executor: ToolExecutor,
}

impl ToolOrchestrator {
    pub fn new(registry: ToolRegistry, table: CapabilityTable, executor: ToolExecutor) -> Self {
        Self { registry, table, executor }
    }

    /// A name already registered is left untouched.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        self.registry.register(tool)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }

    pub fn metrics(&self) -> Arc<ToolMetrics> {
        self.executor.metrics()
    }

    pub fn validate_capability_table(&self) -> Result<(), OrchestratorError> {
        let missing: Vec<String> = self
            .table
            .tool_names()
            .into_iter()
            .filter(|name| !self.registry.contains(name))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::MissingTools(missing))
        }
    }

    pub fn plan(&self, analysis: &IntentAnalysis) -> ExecutionPlan {
        let mut seen = BTreeSet::new();
        let mut ranked: Vec<(Phase, usize, String)> = Vec::new();

        for route in self.table.routes() {
            if !analysis.requires(route.capability) {
                continue;
            }
            for tool in &route.tools {
                if !self.registry.contains(tool) {
                    warn!(
                        event_name = "agent.plan.unregistered_tool",
                        tool_name = %tool,
                        capability = route.capability.as_str(),
                        "capability routes to an unregistered tool; skipping"
                    );
                    continue;
                }
                if !seen.insert(tool.clone()) {
                    continue;
                }
                let tiebreak = match route.phase {
                    Phase::Unranked => self.registry.position(tool).unwrap_or(usize::MAX),
                    _ => 0,
                };
                ranked.push((route.phase, tiebreak, tool.clone()));
            }
        }

        // Stable sort keeps table order within a ranked phase.
        ranked.sort_by_key(|(phase, tiebreak, _)| (*phase, *tiebreak));
        let tools: Vec<String> = ranked.into_iter().map(|(_, _, tool)| tool).collect();
        let multi_round = tools.len() > 1 || analysis.complexity == Complexity::Complex;

        ExecutionPlan::new(tools, analysis.required_capabilities.clone(), multi_round)
    }

    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        context: &Value,
        options: &ExecutionOptions,
    ) -> ExecutionReport {
        self.execute_with_observer(plan, context, options, &NoopToolObserver).await
    }

    pub async fn execute_with_observer(
        &self,
        plan: &ExecutionPlan,
        context: &Value,
        options: &ExecutionOptions,
        observer: &dyn ToolObserver,
    ) -> ExecutionReport {
        let steps = plan.tools().iter().map(|name| (name.clone(), context.clone())).collect();
        self.run_serial(steps, options, observer).await
    }

    /// Runs model-requested calls in order with the same rules as a plan.
    pub async fn execute_calls(
        &self,
        calls: &[ToolCall],
        context: &Value,
        options: &ExecutionOptions,
        observer: &dyn ToolObserver,
    ) -> ExecutionReport {
        let steps = calls
            .iter()
            .map(|call| (call.name.clone(), merge_input(context, &call.arguments)))
            .collect();
        self.run_serial(steps, options, observer).await
    }

    async fn run_serial(
        &self,
        steps: Vec<(String, Value)>,
        options: &ExecutionOptions,
        observer: &dyn ToolObserver,
    ) -> ExecutionReport {
        if options.parallel {
            warn!(
                event_name = "agent.orchestrator.parallel_rejected",
                "parallel tool execution is not supported; running serially"
            );
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        let total = steps.len();
        let mut report =
            ExecutionReport { results: Vec::with_capacity(total), ..ExecutionReport::default() };
        let mut previous: Option<Value> = None;

        for (index, (name, input)) in steps.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    event_name = "agent.orchestrator.cancelled",
                    completed = index,
                    total,
                    "tool execution cancelled"
                );
                report.cancelled = true;
                break;
            }

            observer.on_tool_start(&name, index, total).await;

            let input = thread_previous(input, previous.as_ref());
            let execution = async {
                match self.registry.get(&name) {
                    Some((spec, tool)) => {
                        (self.executor.execute(tool.as_ref(), spec, input).await, spec.critical)
                    }
                    None => (unregistered_result(&name), false),
                }
            };
            // The in-flight tool is dropped when the caller goes away.
            let (result, critical) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(
                        event_name = "agent.orchestrator.cancelled",
                        tool_name = %name,
                        completed = index,
                        total,
                        "running tool abandoned on cancellation"
                    );
                    report.cancelled = true;
                    break;
                }
                outcome = execution => outcome,
            };

            observer.on_tool_finish(&result).await;

            if result.success {
                previous = result.payload.clone();
            }
            let halt = !result.success && (critical || options.stop_on_error);
            if halt {
                info!(
                    event_name = "agent.orchestrator.halted",
                    tool_name = %name,
                    critical,
                    skipped = total - index - 1,
                    "tool failure halted the remaining plan"
                );
                report.halted_by = Some(Halt {
                    tool: name,
                    critical,
                    error: result.error.clone().unwrap_or_default(),
                });
            }
            report.results.push(result);

            if halt {
                break;
            }
        }

        report
    }
}

/// Context keys that identify the caller. Model-chosen arguments never
/// override them.
const CALLER_KEYS: [&str; 2] = ["tenantId", "userId"];

fn merge_input(context: &Value, arguments: &Value) -> Value {
    let mut merged = match (context, arguments) {
        (Value::Object(context), Value::Object(arguments)) => {
            let mut merged = context.clone();
            merged.extend(arguments.clone());
            merged
        }
        (_, Value::Object(arguments)) => arguments.clone(),
        (Value::Object(context), _) => context.clone(),
        _ => return context.clone(),
    };
    if let Value::Object(context) = context {
        for key in CALLER_KEYS {
            match context.get(key) {
                Some(value) => {
                    merged.insert(key.to_string(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
    }
    Value::Object(merged)
}

fn thread_previous(input: Value, previous: Option<&Value>) -> Value {
    let Some(previous) = previous else {
        return input;
    };

    let mut object = match input {
        Value::Object(object) => object,
        Value::Null => Map::new(),
        other => {
            let mut object = Map::new();
            object.insert("context".to_string(), other);
            object
        }
    };
    object.insert("previousResult".to_string(), previous.clone());
    Value::Object(object)
}

fn unregistered_result(name: &str) -> ToolExecutionResult {
    let now = Utc::now();
    ToolExecutionResult {
        tool_name: name.to_string(),
        success: false,
        payload: None,
        error: Some(ToolError::NotFound(name.to_string()).to_string()),
        duration_ms: 0,
        retries: 0,
        timed_out: false,
        started_at: now,
        finished_at: now,
    }
}

/// Capabilities whose routed tools failed in `results`.
pub fn failed_capabilities(
    table: &CapabilityTable,
    results: &[ToolExecutionResult],
) -> BTreeSet<Capability> {
    results
        .iter()
        .filter(|result| !result.success)
        .flat_map(|result| {
            table
                .routes()
                .iter()
                .filter(|route| route.tools.iter().any(|tool| tool == &result.tool_name))
                .map(|route| route.capability)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Input context handed to the first tool of a plan.
pub fn plan_context(query: &str, analysis: &IntentAnalysis, extra: Option<&Value>) -> Value {
    let mut context = json!({
        "query": query,
        "intent": analysis.intent.as_str(),
        "keywords": analysis.keywords,
        "entities": analysis.entities,
    });
    if let (Some(Value::Object(extra)), Value::Object(object)) = (extra, &mut context) {
        for (key, value) in extra {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    context
}
