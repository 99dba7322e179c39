use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sprout_core::config::AppConfig;
use sprout_core::domain::chat::{ChatMessage, ToolCall};
use sprout_core::domain::intent::{Capability, IntentAnalysis};
use sprout_core::domain::session::SessionId;
use sprout_core::domain::tool::ToolExecutionResult;
use sprout_core::errors::ApplicationError;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::intent::{requires_tools, IntentClassifier};
use crate::llm::{ModelClient, ModelError, ModelRequest};
use crate::memory::{MemoryContext, MemoryRetriever, RetrievalOptions};
use crate::orchestrator::{
    failed_capabilities, plan_context, ExecutionOptions, ExecutionReport, ToolObserver,
    ToolOrchestrator,
};
use crate::prompt_cache::{PromptCache, PromptContext};
use crate::session::{SessionError, SessionManager};
use crate::stream::{StreamEmitter, StreamError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),
    #[error("turn cancelled by the client")]
    Cancelled,
    #[error("critical tool `{tool}` failed: {error}")]
    CriticalTool { tool: String, error: String },
}

impl RuntimeError {
    /// Stable code carried by the `error` stream event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Session(SessionError::Persistence(_)) => "session_persistence",
            Self::Session(_) => "session_protocol",
            Self::Model(_) => "model_unavailable",
            Self::Cancelled => "cancelled",
            Self::CriticalTool { .. } => "critical_tool_failed",
        }
    }
}

impl From<RuntimeError> for ApplicationError {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::Session(error) => error.into(),
            RuntimeError::Model(ModelError::Configuration(message)) => {
                ApplicationError::Configuration(message)
            }
            RuntimeError::Model(error) => ApplicationError::Integration(error.to_string()),
            RuntimeError::Cancelled => ApplicationError::Integration("turn cancelled".to_string()),
            error @ RuntimeError::CriticalTool { .. } => {
                ApplicationError::Integration(error.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Upper bound on model calls within one turn.
    pub max_model_calls: usize,
    pub memory_enabled: bool,
    pub retrieval: RetrievalOptions,
    pub temperature: Option<f32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_model_calls: 12,
            memory_enabled: true,
            retrieval: RetrievalOptions::default(),
            temperature: Some(0.3),
        }
    }
}

impl From<&AppConfig> for RuntimeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            memory_enabled: config.memory.enabled,
            retrieval: RetrievalOptions::from(&config.memory),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnRequest {
    /// Absent for a new conversation.
    pub session_id: Option<SessionId>,
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub message: String,
    pub page_path: Option<String>,
    pub mode_flags: BTreeSet<String>,
    pub context: Option<Value>,
    /// Round limit for a new session; the manager default when absent.
    pub max_rounds: Option<u32>,
    /// Marks the session complete after this turn.
    pub finalize: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub reply: String,
    pub analysis: IntentAnalysis,
    pub tool_results: Vec<ToolExecutionResult>,
    pub failed_capabilities: BTreeSet<Capability>,
    pub rounds: u32,
    pub quality_score: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheSweep {
    pub intents: usize,
    pub memories: usize,
}

/// Forwards orchestrator progress to the client stream.
struct StreamObserver<'a> {
    emitter: &'a StreamEmitter,
}

#[async_trait]
impl ToolObserver for StreamObserver<'_> {
    async fn on_tool_start(&self, tool_name: &str, index: usize, total: usize) {
        stream_sent(self.emitter.tool_start(tool_name, index, total).await);
    }

    async fn on_tool_finish(&self, result: &ToolExecutionResult) {
        let sent = if result.success {
            self.emitter.tool_success(result).await
        } else {
            self.emitter.tool_error(result).await
        };
        stream_sent(sent);
    }
}

/// Drives conversational turns. One turn per session runs at a time.
pub struct AgentRuntime {
    classifier: IntentClassifier,
    orchestrator: ToolOrchestrator,
    memory: Option<MemoryRetriever>,
    prompts: Arc<PromptCache>,
    sessions: Arc<SessionManager>,
    model: Arc<dyn ModelClient>,
    config: RuntimeConfig,
    turn_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl AgentRuntime {
    pub fn new(
        classifier: IntentClassifier,
        orchestrator: ToolOrchestrator,
        prompts: Arc<PromptCache>,
        sessions: Arc<SessionManager>,
        model: Arc<dyn ModelClient>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            classifier,
            orchestrator,
            memory: None,
            prompts,
            sessions,
            model,
            config,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_memory(mut self, retriever: MemoryRetriever) -> Self {
        self.memory = Some(retriever);
        self
    }

    pub fn orchestrator(&self) -> &ToolOrchestrator {
        &self.orchestrator
    }

    pub fn prompts(&self) -> &Arc<PromptCache> {
        &self.prompts
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Runs one turn and ends the stream with `complete` or `error`.
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        emitter: &StreamEmitter,
    ) -> Result<TurnOutcome, RuntimeError> {
        let outcome = match self
            .sessions
            .start(request.session_id.clone(), &request.user_id, request.max_rounds)
            .await
        {
            Ok(session) => {
                let lock = self.turn_lock(&session.id).await;
                let _turn = lock.lock().await;

                let heartbeat = emitter.start_heartbeat();
                let outcome = self.run_turn(&session.id, &request, emitter).await;
                if let Err(error) = &outcome {
                    // Nothing to mark when the failure happened outside a round.
                    let _ = self.sessions.mark_error(&session.id, &error.to_string()).await;
                }
                heartbeat.abort();
                outcome
            }
            Err(error) => Err(error.into()),
        };

        match &outcome {
            Ok(outcome) => {
                info!(
                    event_name = "agent.turn.completed",
                    session_id = %outcome.session_id,
                    intent = outcome.analysis.intent.as_str(),
                    tools = outcome.tool_results.len(),
                    failed = outcome.failed_capabilities.len(),
                    quality_score = outcome.quality_score,
                    "turn completed"
                );
                let summary = json!({
                    "sessionId": outcome.session_id.0,
                    "round": outcome.rounds,
                    "intent": outcome.analysis.intent.as_str(),
                    "failedCapabilities": outcome
                        .failed_capabilities
                        .iter()
                        .map(Capability::as_str)
                        .collect::<Vec<_>>(),
                    "qualityScore": outcome.quality_score,
                    "metrics": emitter.metrics(),
                });
                stream_sent(emitter.complete(summary).await);
            }
            Err(error) => {
                warn!(
                    event_name = "agent.turn.failed",
                    code = error.code(),
                    error = %error,
                    "turn failed"
                );
                stream_sent(emitter.error(&error.to_string(), error.code()).await);
            }
        }

        outcome
    }

    /// Drops expired intent and memory cache entries.
    pub async fn sweep_caches(&self) -> CacheSweep {
        let intents = self.classifier.sweep_expired().await;
        let memories = match &self.memory {
            Some(retriever) => retriever.sweep_expired().await,
            None => 0,
        };
        CacheSweep { intents, memories }
    }

    /// Evicts idle sessions and drops their turn locks.
    pub async fn evict_idle(&self, threshold: Duration) -> Vec<SessionId> {
        let evicted = self.sessions.evict_idle(threshold).await;
        let mut locks = self.turn_locks.lock().await;
        for id in &evicted {
            if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(id);
            }
        }
        evicted
    }

    async fn turn_lock(&self, id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    async fn run_turn(
        &self,
        id: &SessionId,
        request: &TurnRequest,
        emitter: &StreamEmitter,
    ) -> Result<TurnOutcome, RuntimeError> {
        let cancel = emitter.cancellation_token();
        stream_sent(emitter.connected(&id.0).await);

        self.sessions.begin_round(id, &request.message).await?;

        stream_sent(emitter.progress("memory", 10).await);
        let memory = self.retrieve_memory(request).await;

        stream_sent(emitter.progress("intent", 25).await);
        let analysis = self.classifier.classify(&request.message, request.context.as_ref()).await;
        debug!(
            event_name = "agent.turn.classified",
            session_id = %id,
            intent = analysis.intent.as_str(),
            complexity = analysis.complexity.as_str(),
            cache_hit = analysis.cache_hit,
            "request classified"
        );

        let mut prompt_context = PromptContext {
            tenant_id: request.tenant_id.clone(),
            page_path: request.page_path.clone(),
            mode_flags: request.mode_flags.clone(),
            selected_tools: Vec::new(),
        };
        let options = ExecutionOptions {
            parallel: false,
            stop_on_error: false,
            cancel: Some(cancel.clone()),
        };
        let observer = StreamObserver { emitter };
        let tool_context =
            plan_context(&request.message, &analysis, Some(&caller_context(request)));
        let mut tool_results = Vec::new();

        if requires_tools(&analysis) {
            let plan = self.orchestrator.plan(&analysis);
            if !plan.is_empty() {
                prompt_context.selected_tools = plan.tools().to_vec();
                stream_sent(emitter.progress("tools", 40).await);

                let round = self.current_round(id).await;
                let calls = plan
                    .tools()
                    .iter()
                    .enumerate()
                    .map(|(index, name)| ToolCall {
                        id: format!("plan_{round}_{index}"),
                        name: name.clone(),
                        arguments: json!({}),
                    })
                    .collect();
                self.sessions.record_tool_calls(id, calls).await?;

                let report = self
                    .orchestrator
                    .execute_with_observer(&plan, &tool_context, &options, &observer)
                    .await;
                self.sessions.record_tool_results(id, report.results.clone()).await?;
                ensure_no_critical_halt(&report)?;
                tool_results.extend(report.results);
            }
        }
        ensure_live(&cancel)?;

        let system_prompt = self
            .prompts
            .system_prompt(
                &request.role,
                &prompt_context,
                self.orchestrator.table(),
                self.orchestrator.registry(),
            )
            .await;
        let system_prompt = with_memory_section(system_prompt, memory.as_ref());

        stream_sent(emitter.progress("model", 60).await);
        let mut round_open = true;
        let mut model_calls = 0;
        let reply = loop {
            model_calls += 1;
            let mut messages = vec![ChatMessage::system(system_prompt.clone())];
            messages.extend(self.sessions.to_messages(id).await?);

            let model_request = ModelRequest {
                messages,
                tools: self.orchestrator.registry().specs(),
                temperature: self.config.temperature,
                json_mode: false,
            };
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                response = self.model.chat(model_request) => response?,
            };

            let content = response.content.unwrap_or_default();
            if response.tool_calls.is_empty() {
                break content;
            }
            if model_calls >= self.config.max_model_calls {
                warn!(
                    event_name = "agent.turn.model_call_limit",
                    session_id = %id,
                    limit = self.config.max_model_calls,
                    "model still requesting tools at the call limit"
                );
                self.sessions.set_awaiting_input(id, true).await?;
                break content;
            }

            if self.round_has_tool_calls(id).await {
                self.sessions.complete_round(id).await?;
                if !self.sessions.should_continue(id).await? {
                    round_open = false;
                    break content;
                }
                self.sessions.begin_round(id, "").await?;
            }
            if !content.is_empty() {
                self.sessions.record_reply(id, &content).await?;
            }

            self.sessions.record_tool_calls(id, response.tool_calls.clone()).await?;
            let report = self
                .orchestrator
                .execute_calls(&response.tool_calls, &tool_context, &options, &observer)
                .await;
            self.sessions.record_tool_results(id, report.results.clone()).await?;
            ensure_no_critical_halt(&report)?;
            tool_results.extend(report.results);
            ensure_live(&cancel)?;
        };

        let failed = failed_capabilities(self.orchestrator.table(), &tool_results);
        let reply = with_failure_notice(reply, &failed);
        if round_open {
            self.sessions.record_reply(id, &reply).await?;
            self.sessions.complete_round(id).await?;
        }

        stream_sent(emitter.progress("responding", 90).await);
        stream_sent(emitter.message(&reply).await);

        if request.finalize {
            self.sessions.complete(id, Some(json!({ "reply": reply }))).await?;
        } else if let Err(error) = self.sessions.persist(id).await {
            warn!(
                event_name = "agent.session.persist_failed",
                session_id = %id,
                error = %error,
                "session snapshot was not written"
            );
        }

        Ok(TurnOutcome {
            session_id: id.clone(),
            reply,
            analysis,
            tool_results,
            failed_capabilities: failed,
            rounds: self.current_round(id).await,
            quality_score: self.sessions.quality_score(id).await?,
        })
    }

    async fn retrieve_memory(&self, request: &TurnRequest) -> Option<MemoryContext> {
        if !self.config.memory_enabled {
            return None;
        }
        let retriever = self.memory.as_ref()?;
        let context =
            retriever.retrieve(&request.message, &request.user_id, &self.config.retrieval).await;
        (!context.is_empty()).then_some(context)
    }

    async fn current_round(&self, id: &SessionId) -> u32 {
        self.sessions.get(id).await.map(|session| session.current_round).unwrap_or_default()
    }

    async fn round_has_tool_calls(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .await
            .and_then(|session| session.last_round().map(|round| round.made_tool_calls()))
            .unwrap_or(false)
    }
}

/// Caller identity plus any client-supplied context, for tool inputs.
fn caller_context(request: &TurnRequest) -> Value {
    let mut context = serde_json::Map::new();
    context.insert("tenantId".to_string(), json!(request.tenant_id));
    context.insert("userId".to_string(), json!(request.user_id));
    if let Some(page_path) = &request.page_path {
        context.insert("pagePath".to_string(), json!(page_path));
    }
    if let Some(Value::Object(extra)) = &request.context {
        for (key, value) in extra {
            context.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    Value::Object(context)
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), RuntimeError> {
    if cancel.is_cancelled() {
        Err(RuntimeError::Cancelled)
    } else {
        Ok(())
    }
}

fn ensure_no_critical_halt(report: &ExecutionReport) -> Result<(), RuntimeError> {
    match report.critical_halt() {
        Some(halt) => {
            Err(RuntimeError::CriticalTool { tool: halt.tool.clone(), error: halt.error.clone() })
        }
        None => Ok(()),
    }
}

fn stream_sent(result: Result<(), StreamError>) {
    match result {
        Ok(()) | Err(StreamError::Closed) => {}
        Err(error) => warn!(event_name = "agent.stream.emit_failed", error = %error, "stream event dropped"),
    }
}

fn with_memory_section(prompt: String, memory: Option<&MemoryContext>) -> String {
    match memory {
        Some(memory) => format!("{prompt}\n\n## Relevant memory\n{}", memory.format_for_prompt()),
        None => prompt,
    }
}

fn with_failure_notice(reply: String, failed: &BTreeSet<Capability>) -> String {
    if failed.is_empty() {
        return reply;
    }
    let names: Vec<&str> = failed.iter().map(Capability::as_str).collect();
    let notice = format!("部分能力未能完成：{}", names.join(", "));
    if reply.trim().is_empty() {
        notice
    } else {
        format!("{reply}\n\n{notice}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use sprout_core::domain::chat::ToolCall;
    use sprout_core::domain::memory::{MemoryDimension, MemoryItem, MemoryStore};
    use sprout_core::domain::organization::{OrganizationStats, OrganizationStatsSource};
    use sprout_core::domain::session::{RoundStatus, SessionId};
    use sprout_core::domain::tool::ToolSpec;
    use sprout_core::errors::ApplicationError;

    use super::{AgentRuntime, CacheSweep, RuntimeConfig, RuntimeError, TurnRequest};
    use crate::intent::{ClassifierConfig, IntentClassifier};
    use crate::llm::{ModelClient, ModelError, ModelRequest, ModelResponse};
    use crate::memory::MemoryRetriever;
    use crate::orchestrator::{CapabilityTable, ToolOrchestrator};
    use crate::prompt_cache::{PromptCache, PromptCacheConfig};
    use crate::session::{SessionError, SessionManager};
    use crate::stream::{channel, EmitterConfig};
    use crate::tools::{ExecutorConfig, Tool, ToolError, ToolExecutor, ToolRegistry};

    struct ScriptedModel {
        replies: Mutex<VecDeque<ModelResponse>>,
        requests: Mutex<Vec<ModelRequest>>,
        latency: Duration,
    }

    impl ScriptedModel {
        fn new(replies: Vec<ModelResponse>) -> Arc<Self> {
            Self::slow(replies, Duration::ZERO)
        }

        fn slow(replies: Vec<ModelResponse>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                latency,
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
            self.requests.lock().expect("requests lock").push(request);
            tokio::time::sleep(self.latency).await;
            Ok(self.replies.lock().expect("replies lock").pop_front().unwrap_or_default())
        }
    }

    struct CountingTool {
        name: &'static str,
        fail: bool,
        critical: bool,
        calls: AtomicUsize,
    }

    impl CountingTool {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self { name, fail, critical: false, calls: AtomicUsize::new(0) })
        }

        fn critical(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, fail: true, critical: true, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new(self.name, "test tool").retryable(false).critical(self.critical)
        }

        async fn execute(&self, _input: Value) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ToolError::Failed("database offline".to_string()))
            } else {
                Ok(json!({ "count": 120 }))
            }
        }
    }

    struct FixedStats;

    #[async_trait]
    impl OrganizationStatsSource for FixedStats {
        async fn load_stats(&self, tenant_id: &str) -> Result<OrganizationStats, ApplicationError> {
            Ok(OrganizationStats { student_count: 120, ..OrganizationStats::empty(tenant_id) })
        }
    }

    struct OneMemory;

    #[async_trait]
    impl MemoryStore for OneMemory {
        async fn retrieve_by_dimension(
            &self,
            dimension: MemoryDimension,
            _query: &str,
            _user_id: &str,
        ) -> Result<Vec<MemoryItem>, ApplicationError> {
            if dimension != MemoryDimension::Core {
                return Ok(Vec::new());
            }
            Ok(vec![MemoryItem {
                id: "m1".to_string(),
                dimension,
                content: "园长偏好简洁的回答".to_string(),
                relevance: 0.9,
                timestamp: Utc::now(),
                metadata: Default::default(),
            }])
        }
    }

    fn runtime(
        tools: Vec<Arc<dyn Tool>>,
        model: Arc<ScriptedModel>,
        sessions: SessionManager,
    ) -> AgentRuntime {
        runtime_with_config(tools, model, sessions, RuntimeConfig::default())
    }

    fn runtime_with_config(
        tools: Vec<Arc<dyn Tool>>,
        model: Arc<ScriptedModel>,
        sessions: SessionManager,
        config: RuntimeConfig,
    ) -> AgentRuntime {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let executor = ToolExecutor::with_config(ExecutorConfig {
            default_timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
        });
        let orchestrator = ToolOrchestrator::new(registry, CapabilityTable::default(), executor);
        let prompts = Arc::new(PromptCache::new(Arc::new(FixedStats), PromptCacheConfig::default()));

        AgentRuntime::new(
            IntentClassifier::new(ClassifierConfig::default()),
            orchestrator,
            prompts,
            Arc::new(sessions),
            model,
            config,
        )
        .with_memory(MemoryRetriever::new(Arc::new(OneMemory), Duration::from_secs(60)))
    }

    fn request(message: &str, session_id: Option<SessionId>) -> TurnRequest {
        TurnRequest {
            session_id,
            user_id: "teacher-1".to_string(),
            tenant_id: "k1".to_string(),
            role: "principal".to_string(),
            message: message.to_string(),
            ..TurnRequest::default()
        }
    }

    fn reply(content: &str) -> ModelResponse {
        ModelResponse { content: Some(content.to_string()), ..ModelResponse::default() }
    }

    fn tool_request(name: &str) -> ModelResponse {
        ModelResponse {
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                arguments: json!({ "table": "student" }),
            }],
            ..ModelResponse::default()
        }
    }

    fn emitter() -> (crate::stream::StreamEmitter, tokio::task::JoinHandle<Vec<String>>) {
        let config = EmitterConfig { chunk_delay: Duration::ZERO, ..EmitterConfig::default() };
        let (emitter, mut receiver) = channel(config);
        let frames = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = receiver.recv().await {
                frames.push(frame);
            }
            frames
        });
        (emitter, frames)
    }

    fn event_names(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| frame.lines().next())
            .filter_map(|line| line.strip_prefix("event: "))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn query_turn_runs_planned_tool_and_streams_reply() {
        let tool = CountingTool::new("any_query", false);
        let model = ScriptedModel::new(vec![reply("目前共有120名在园学生。")]);
        let runtime = runtime(vec![tool.clone()], model.clone(), SessionManager::default());
        let (emitter, frames) = emitter();

        let outcome =
            runtime.handle_turn(request("查询所有学生人数", None), &emitter).await.expect("turn");
        drop(emitter);
        let names = event_names(&frames.await.expect("collector"));

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.reply, "目前共有120名在园学生。");
        assert!(outcome.failed_capabilities.is_empty());
        assert_eq!(names.first().map(String::as_str), Some("connected"));
        assert!(names.iter().any(|name| name == "tool_start"));
        assert!(names.iter().any(|name| name == "tool_success"));
        assert!(names.iter().any(|name| name == "message"));
        assert_eq!(names.last().map(String::as_str), Some("complete"));

        let request = &model.requests.lock().expect("requests lock")[0];
        assert!(request.messages[0].content.contains("园长偏好简洁的回答"));
        let session = runtime.sessions().get(&outcome.session_id).await.expect("session");
        assert_eq!(session.rounds.len(), 1);
        assert_eq!(session.rounds[0].status, RoundStatus::Complete);
    }

    #[tokio::test]
    async fn failed_tool_yields_partial_answer_naming_capability() {
        let tool = CountingTool::new("any_query", true);
        let model = ScriptedModel::new(vec![reply("暂时无法获取学生数据。")]);
        let runtime = runtime(vec![tool], model, SessionManager::default());
        let (emitter, frames) = emitter();

        let outcome =
            runtime.handle_turn(request("查询所有学生人数", None), &emitter).await.expect("turn");
        drop(emitter);
        let names = event_names(&frames.await.expect("collector"));

        assert!(outcome.reply.starts_with("暂时无法获取学生数据。"));
        assert!(outcome.reply.contains("database_query"));
        assert!(names.iter().any(|name| name == "tool_error"));
    }

    #[tokio::test]
    async fn critical_tool_failure_ends_turn_with_error_event() {
        let tool = CountingTool::critical("any_query");
        let model = ScriptedModel::new(vec![reply("不会被调用")]);
        let runtime = runtime(vec![tool.clone()], model.clone(), SessionManager::default());
        let (emitter, frames) = emitter();

        let error = runtime
            .handle_turn(request("查询所有学生人数", Some(SessionId("critical-1".to_string()))), &emitter)
            .await
            .expect_err("critical failure ends the turn");
        drop(emitter);
        let frames = frames.await.expect("collector");

        assert!(matches!(error, RuntimeError::CriticalTool { ref tool, .. } if tool == "any_query"));
        assert_eq!(error.code(), "critical_tool_failed");
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(model.calls(), 0);
        assert_eq!(event_names(&frames).last().map(String::as_str), Some("error"));
        assert!(frames.last().is_some_and(|frame| frame.contains("critical_tool_failed")));
        let session = runtime
            .sessions()
            .get(&SessionId("critical-1".to_string()))
            .await
            .expect("session");
        assert_eq!(session.rounds[0].status, RoundStatus::Error);
        assert_eq!(session.rounds[0].tool_results.as_ref().map(Vec::len), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_model_call_cancels_the_turn() {
        let model = ScriptedModel::slow(vec![reply("太迟了")], Duration::from_secs(4));
        let runtime = runtime(Vec::new(), model.clone(), SessionManager::default());
        let (emitter, _frames) = emitter();
        let closer = emitter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            closer.close();
        });

        let started = tokio::time::Instant::now();
        let error = runtime.handle_turn(request("你好", None), &emitter).await.expect_err("cancelled");

        assert!(matches!(error, RuntimeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_sweep_releases_expired_intents_and_memories() {
        let model = ScriptedModel::new(vec![reply("你好！")]);
        let runtime = runtime(Vec::new(), model, SessionManager::default());
        let (emitter, _frames) = emitter();
        runtime.handle_turn(request("你好", None), &emitter).await.expect("turn");

        assert_eq!(runtime.sweep_caches().await, CacheSweep::default());

        tokio::time::advance(Duration::from_secs(301)).await;
        let swept = runtime.sweep_caches().await;

        assert_eq!(swept, CacheSweep { intents: 1, memories: 1 });
        assert_eq!(runtime.sweep_caches().await, CacheSweep::default());
    }

    #[tokio::test]
    async fn requested_round_limit_applies_to_new_sessions() {
        let model = ScriptedModel::new(vec![reply("好的"), reply("不会被调用")]);
        let runtime = runtime(Vec::new(), model.clone(), SessionManager::new(20));
        let (first, _frames) = emitter();
        let outcome = runtime
            .handle_turn(TurnRequest { max_rounds: Some(1), ..request("你好", None) }, &first)
            .await
            .expect("first turn");

        let (second, _frames) = emitter();
        let error = runtime
            .handle_turn(request("再说一次", Some(outcome.session_id.clone())), &second)
            .await
            .expect_err("limit carried by the session");

        assert!(matches!(
            error,
            RuntimeError::Session(SessionError::MaxRoundsReached { max_rounds: 1, .. })
        ));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn model_requested_tools_open_a_continuation_round() {
        let tool = CountingTool::new("any_query", false);
        let model = ScriptedModel::new(vec![tool_request("any_query"), reply("两次查询结果一致。")]);
        let runtime = runtime(vec![tool.clone()], model.clone(), SessionManager::default());
        let (emitter, _frames) = emitter();

        let outcome =
            runtime.handle_turn(request("查询所有学生人数", None), &emitter).await.expect("turn");

        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.calls(), 2);
        let session = runtime.sessions().get(&outcome.session_id).await.expect("session");
        assert_eq!(session.rounds.len(), 2);
        assert_eq!(session.rounds[1].user_message, "");
        assert_eq!(session.rounds[1].reply.as_deref(), Some("两次查询结果一致。"));
        assert_eq!(outcome.rounds, 2);
    }

    #[tokio::test]
    async fn small_talk_tool_request_stays_in_the_same_round() {
        let tool = CountingTool::new("any_query", false);
        let model = ScriptedModel::new(vec![tool_request("any_query"), reply("你好！今天有120名学生。")]);
        let runtime = runtime(vec![tool.clone()], model.clone(), SessionManager::default());
        let (emitter, _frames) = emitter();

        let outcome = runtime.handle_turn(request("你好", None), &emitter).await.expect("turn");

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        let session = runtime.sessions().get(&outcome.session_id).await.expect("session");
        assert_eq!(session.rounds.len(), 1);
        assert!(session.rounds[0].made_tool_calls());
        let second_request = &model.requests.lock().expect("requests lock")[1];
        assert!(second_request.messages.iter().any(|message| message.tool_call_id.as_deref() == Some("call_1")));
    }

    #[tokio::test]
    async fn model_call_limit_marks_round_awaiting_input() {
        let tool = CountingTool::new("any_query", false);
        let model = ScriptedModel::new(vec![tool_request("any_query"), reply("unused")]);
        let config = RuntimeConfig { max_model_calls: 1, ..RuntimeConfig::default() };
        let runtime =
            runtime_with_config(vec![tool.clone()], model.clone(), SessionManager::default(), config);
        let (emitter, _frames) = emitter();

        let outcome = runtime.handle_turn(request("你好", None), &emitter).await.expect("turn");

        assert_eq!(model.calls(), 1);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        let session = runtime.sessions().get(&outcome.session_id).await.expect("session");
        assert_eq!(session.rounds.len(), 1);
        assert!(session.rounds[0].awaiting_input);
        assert_eq!(session.rounds[0].status, RoundStatus::Complete);
    }

    #[tokio::test]
    async fn round_limit_ends_turn_with_error_event() {
        let model = ScriptedModel::new(vec![reply("好的"), reply("不会被调用")]);
        let runtime = runtime(Vec::new(), model.clone(), SessionManager::new(1));
        let (first, _frames) = emitter();
        let outcome = runtime.handle_turn(request("你好", None), &first).await.expect("first turn");

        let (second, frames) = emitter();
        let error = runtime
            .handle_turn(request("再说一次", Some(outcome.session_id.clone())), &second)
            .await
            .expect_err("second turn exceeds the limit");
        drop(second);
        let frames = frames.await.expect("collector");

        assert!(matches!(error, RuntimeError::Session(SessionError::MaxRoundsReached { .. })));
        assert_eq!(event_names(&frames).last().map(String::as_str), Some("error"));
        assert!(frames.last().is_some_and(|frame| frame.contains("session_protocol")));
        assert_eq!(model.calls(), 1);
        let session = runtime.sessions().get(&outcome.session_id).await.expect("session");
        assert_eq!(session.rounds.len(), 1);
    }

    #[tokio::test]
    async fn disconnected_client_cancels_before_model_call() {
        let model = ScriptedModel::new(vec![reply("unused")]);
        let runtime = runtime(Vec::new(), model.clone(), SessionManager::default());
        let (emitter, receiver) = channel(EmitterConfig::default());
        drop(receiver);

        let error = runtime.handle_turn(request("你好", None), &emitter).await.expect_err("cancelled");

        assert!(matches!(error, RuntimeError::Cancelled));
        assert_eq!(model.calls(), 0);
        assert!(emitter.is_closed());
    }

    #[test]
    fn model_configuration_errors_surface_as_configuration() {
        let error: ApplicationError =
            RuntimeError::Model(ModelError::Configuration("missing api key".to_string())).into();
        assert_eq!(error, ApplicationError::Configuration("missing api key".to_string()));

        let error: ApplicationError =
            RuntimeError::CriticalTool { tool: "any_query".to_string(), error: "boom".to_string() }
                .into();
        assert!(matches!(error, ApplicationError::Integration(_)));
    }
}
