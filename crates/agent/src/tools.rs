use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sprout_core::config::AgentConfig;
use sprout_core::domain::tool::{ToolExecutionResult, ToolSpec};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool `{0}` is not registered")]
    NotFound(String),
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
    #[error("tool execution failed: {0}")]
    Failed(String),
    #[error("tool timed out after {0} ms")]
    Timeout(u64),
}

impl ToolError {
    /// Only transient execution failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, input: Value) -> Result<Value, ToolError>;
}

/// Named tools in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolSpec, Arc<dyn Tool>)>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the name is already taken; the first registration wins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let spec = tool.spec();
        if self.tools.contains_key(&spec.name) {
            return false;
        }

        self.order.push(spec.name.clone());
        self.tools.insert(spec.name.clone(), (spec, tool));
        true
    }

    pub fn get(&self, name: &str) -> Option<(&ToolSpec, Arc<dyn Tool>)> {
        self.tools.get(name).map(|(spec, tool)| (spec, Arc::clone(tool)))
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|(spec, _)| spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|registered| registered == name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order.iter().filter_map(|name| self.spec(name).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&AgentConfig> for ExecutorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            default_timeout: config.tool_timeout(),
            max_retries: config.tool_max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Runs one tool under a deadline with bounded, linearly backed-off retries.
pub struct ToolExecutor {
    config: ExecutorConfig,
    metrics: Arc<ToolMetrics>,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::with_config(ExecutorConfig::default())
    }
}

impl ToolExecutor {
    pub fn with_config(config: ExecutorConfig) -> Self {
        Self { config, metrics: Arc::new(ToolMetrics::default()) }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<ToolMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn execute(
        &self,
        tool: &dyn Tool,
        spec: &ToolSpec,
        input: Value,
    ) -> ToolExecutionResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = spec.deadline(self.config.default_timeout);
        let max_retries = if spec.retryable { self.config.max_retries } else { 0 };
        let mut attempt = 0_u32;

        let outcome = loop {
            match tokio::time::timeout(deadline, tool.execute(input.clone())).await {
                Ok(Ok(payload)) => break Ok(payload),
                Ok(Err(error)) if error.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "agent.tool.retry",
                        tool_name = %spec.name,
                        attempt,
                        error = %error,
                        "tool failed; retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Ok(Err(error)) => break Err((error, false)),
                Err(_) => {
                    let deadline_ms = deadline.as_millis() as u64;
                    warn!(
                        event_name = "agent.tool.timeout",
                        tool_name = %spec.name,
                        deadline_ms,
                        "tool exceeded its deadline"
                    );
                    break Err((ToolError::Timeout(deadline_ms), true));
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(payload) => ToolExecutionResult {
                tool_name: spec.name.clone(),
                success: true,
                payload: Some(payload),
                error: None,
                duration_ms,
                retries: attempt,
                timed_out: false,
                started_at,
                finished_at: Utc::now(),
            },
            Err((error, timed_out)) => ToolExecutionResult {
                tool_name: spec.name.clone(),
                success: false,
                payload: None,
                error: Some(error.to_string()),
                duration_ms,
                retries: attempt,
                timed_out,
                started_at,
                finished_at: Utc::now(),
            },
        };

        info!(
            event_name = "agent.tool.finished",
            tool_name = %result.tool_name,
            success = result.success,
            duration_ms = result.duration_ms,
            retries = result.retries,
            "tool execution finished"
        );
        self.metrics.record(&result).await;
        result
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub total_duration_ms: u64,
}

impl ToolStats {
    pub fn mean_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.calls as f64
    }

    pub fn failure_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.failures as f64 / self.calls as f64
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolStatsReport {
    pub tool_name: String,
    #[serde(flatten)]
    pub stats: ToolStats,
    pub mean_duration_ms: f64,
    pub failure_rate: f64,
}

impl ToolStatsReport {
    fn new(tool_name: &str, stats: &ToolStats) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            stats: stats.clone(),
            mean_duration_ms: stats.mean_duration_ms(),
            failure_rate: stats.failure_rate(),
        }
    }
}

/// Process-lifetime counters per tool name.
#[derive(Debug, Default)]
pub struct ToolMetrics {
    stats: RwLock<HashMap<String, ToolStats>>,
}

impl ToolMetrics {
    pub async fn record(&self, result: &ToolExecutionResult) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(result.tool_name.clone()).or_default();
        entry.calls += 1;
        if result.success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        if result.timed_out {
            entry.timeouts += 1;
        }
        entry.retries += u64::from(result.retries);
        entry.total_duration_ms += result.duration_ms;
    }

    pub async fn get(&self, tool_name: &str) -> Option<ToolStats> {
        self.stats.read().await.get(tool_name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ToolStatsReport> {
        let stats = self.stats.read().await;
        let mut reports: Vec<_> =
            stats.iter().map(|(name, stats)| ToolStatsReport::new(name, stats)).collect();
        reports.sort_by(|left, right| left.tool_name.cmp(&right.tool_name));
        reports
    }

    /// Ranked by failure rate, then by mean duration, worst first.
    pub async fn worst_performing(&self, limit: usize) -> Vec<ToolStatsReport> {
        let mut reports = self.snapshot().await;
        reports.sort_by(|left, right| {
            right
                .failure_rate
                .total_cmp(&left.failure_rate)
                .then_with(|| right.mean_duration_ms.total_cmp(&left.mean_duration_ms))
        });
        reports.truncate(limit);
        reports
    }
}
