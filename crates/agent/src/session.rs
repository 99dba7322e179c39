use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sprout_core::domain::chat::{ChatMessage, ToolCall};
use sprout_core::domain::session::{
    ChatRound, ConversationSession, RoundStatus, SessionId, DEFAULT_MAX_ROUNDS,
};
use sprout_core::domain::tool::ToolExecutionResult;
use sprout_core::errors::{ApplicationError, DomainError};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("session `{0}` was not found")]
    NotFound(SessionId),
    #[error("session `{session_id}` reached its maximum of {max_rounds} rounds")]
    MaxRoundsReached { session_id: SessionId, max_rounds: u32 },
    #[error("session `{0}` is already complete")]
    AlreadyComplete(SessionId),
    #[error("session `{0}` has no open round")]
    NoOpenRound(SessionId),
    #[error("session `{0}` still has a round in progress")]
    RoundInProgress(SessionId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invalid session id `{0}`")]
    InvalidId(String),
    #[error("unsupported snapshot schema version {found} (max {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("session persistence failed: {0}")]
    Persistence(String),
}

impl From<SessionError> for ApplicationError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Domain(domain) => ApplicationError::Domain(domain),
            SessionError::Persistence(message) => ApplicationError::Persistence(message),
            other => ApplicationError::Domain(DomainError::SessionProtocol(other.to_string())),
        }
    }
}

/// Serialized form of a session: one JSON document per file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub session: ConversationSession,
}

impl SessionSnapshot {
    pub fn of(session: &ConversationSession) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            exported_at: Utc::now(),
            session: session.clone(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError>;
    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, SessionError>;
    async fn delete(&self, id: &SessionId) -> Result<(), SessionError>;
    async fn list(&self) -> Result<Vec<SessionId>, SessionError>;
}

/// `<dir>/<session_id>.json`; a missing file means no prior session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        let valid = !id.0.is_empty()
            && id.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::InvalidId(id.0.clone()));
        }
        Ok(self.dir.join(format!("{}.json", id.0)))
    }
}

fn io_error(error: std::io::Error) -> SessionError {
    SessionError::Persistence(error.to_string())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        let path = self.path_for(&snapshot.session.id)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|error| SessionError::Persistence(error.to_string()))?;

        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await.map_err(io_error)?;
        tokio::fs::rename(&staging, &path).await.map_err(io_error)
    }

    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, SessionError> {
        let path = self.path_for(id)?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(error)),
        };

        let snapshot: SessionSnapshot = serde_json::from_slice(&body)
            .map_err(|error| SessionError::Persistence(format!("{}: {error}", path.display())))?;
        Ok(Some(snapshot))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(io_error(error)),
        }
    }

    async fn list(&self) -> Result<Vec<SessionId>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(io_error(error)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(SessionId(stem.to_string()));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    snapshots: RwLock<HashMap<SessionId, SessionSnapshot>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        self.snapshots.write().await.insert(snapshot.session.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, SessionError> {
        Ok(self.snapshots.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        self.snapshots.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>, SessionError> {
        let mut ids: Vec<_> = self.snapshots.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Owns live sessions and enforces the round protocol:
/// `begin_round` -> record reply / calls / results -> `complete_round` or `mark_error`.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, ConversationSession>>,
    store: Option<Arc<dyn SessionStore>>,
    max_rounds: u32,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROUNDS)
    }
}

impl SessionManager {
    pub fn new(max_rounds: u32) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), store: None, max_rounds }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Resumes a live or persisted session when `id` is known, otherwise
    /// creates one under `id` (or a fresh id).
    /// Returns the live or stored session for `id`, or creates one. `max_rounds`
    /// only applies to a newly created session.
    pub async fn start(
        &self,
        id: Option<SessionId>,
        owner_id: &str,
        max_rounds: Option<u32>,
    ) -> Result<ConversationSession, SessionError> {
        if let Some(id) = &id {
            if let Some(session) = self.sessions.read().await.get(id) {
                return Ok(session.clone());
            }
            if let Some(store) = &self.store {
                if let Some(snapshot) = store.load(id).await? {
                    check_snapshot(&snapshot)?;
                    let session = snapshot.session;
                    self.sessions.write().await.insert(session.id.clone(), session.clone());
                    info!(
                        event_name = "agent.session.resumed",
                        session_id = %session.id,
                        rounds = session.rounds.len(),
                        "session resumed from store"
                    );
                    return Ok(session);
                }
            }
        }

        let id = id.unwrap_or_else(|| SessionId(uuid::Uuid::new_v4().to_string()));
        let max_rounds = max_rounds.filter(|limit| *limit > 0).unwrap_or(self.max_rounds);
        let session = ConversationSession::new(id, owner_id, max_rounds);
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session.id.clone()).or_insert(session).clone();
        info!(event_name = "agent.session.started", session_id = %session.id, "session started");
        Ok(session)
    }

    pub async fn get(&self, id: &SessionId) -> Option<ConversationSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Opens the next round. The session is left untouched on error.
    pub async fn begin_round(
        &self,
        id: &SessionId,
        user_message: &str,
    ) -> Result<u32, SessionError> {
        self.with_session(id, |session| {
            if session.is_complete {
                return Err(SessionError::AlreadyComplete(session.id.clone()));
            }
            if session.at_round_limit() {
                return Err(SessionError::MaxRoundsReached {
                    session_id: session.id.clone(),
                    max_rounds: session.max_rounds,
                });
            }
            if session.last_round().is_some_and(|round| !round.status.is_terminal()) {
                return Err(SessionError::RoundInProgress(session.id.clone()));
            }

            let number = session.current_round + 1;
            let mut round = ChatRound::new(number, user_message);
            round.status = round.status.transition(RoundStatus::Processing)?;
            session.rounds.push(round);
            session.current_round = number;
            Ok(number)
        })
        .await
    }

    pub async fn record_reply(&self, id: &SessionId, reply: &str) -> Result<(), SessionError> {
        self.with_open_round(id, |round| {
            round.reply = Some(reply.to_string());
            Ok(())
        })
        .await
    }

    pub async fn record_tool_calls(
        &self,
        id: &SessionId,
        calls: Vec<ToolCall>,
    ) -> Result<(), SessionError> {
        self.with_open_round(id, |round| {
            round.tool_calls.get_or_insert_with(Vec::new).extend(calls);
            Ok(())
        })
        .await
    }

    pub async fn record_tool_results(
        &self,
        id: &SessionId,
        results: Vec<ToolExecutionResult>,
    ) -> Result<(), SessionError> {
        self.with_open_round(id, |round| {
            round.tool_results.get_or_insert_with(Vec::new).extend(results);
            Ok(())
        })
        .await
    }

    pub async fn set_awaiting_input(
        &self,
        id: &SessionId,
        awaiting_input: bool,
    ) -> Result<(), SessionError> {
        self.with_open_round(id, |round| {
            round.awaiting_input = awaiting_input;
            Ok(())
        })
        .await
    }

    pub async fn complete_round(&self, id: &SessionId) -> Result<(), SessionError> {
        self.with_open_round(id, |round| {
            round.status = round.status.transition(RoundStatus::Complete)?;
            Ok(())
        })
        .await
    }

    pub async fn mark_error(&self, id: &SessionId, message: &str) -> Result<(), SessionError> {
        self.with_open_round(id, |round| {
            round.status = round.status.transition(RoundStatus::Error)?;
            round.error = Some(message.to_string());
            Ok(())
        })
        .await
    }

    /// Another round is warranted only after a clean round that called tools.
    pub async fn should_continue(&self, id: &SessionId) -> Result<bool, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.clone()))?;
        Ok(continuation_allowed(session))
    }

    pub async fn complete(
        &self,
        id: &SessionId,
        final_result: Option<Value>,
    ) -> Result<(), SessionError> {
        self.with_session(id, |session| {
            session.is_complete = true;
            session.final_result = final_result;
            Ok(())
        })
        .await?;
        self.persist(id).await
    }

    pub async fn export(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.clone()))?;
        Ok(SessionSnapshot::of(session))
    }

    /// Live state when the session is resident, otherwise the stored snapshot.
    pub async fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        match self.export(id).await {
            Err(SessionError::NotFound(_)) => {
                let Some(store) = &self.store else {
                    return Err(SessionError::NotFound(id.clone()));
                };
                let snapshot =
                    store.load(id).await?.ok_or_else(|| SessionError::NotFound(id.clone()))?;
                check_snapshot(&snapshot)?;
                Ok(snapshot)
            }
            other => other,
        }
    }

    /// Replaces any live session with the same id.
    pub async fn import(&self, snapshot: SessionSnapshot) -> Result<SessionId, SessionError> {
        check_snapshot(&snapshot)?;
        let id = snapshot.session.id.clone();
        self.sessions.write().await.insert(id.clone(), snapshot.session);
        Ok(id)
    }

    pub async fn to_messages(&self, id: &SessionId) -> Result<Vec<ChatMessage>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.clone()))?;
        Ok(session_messages(session))
    }

    pub async fn quality_score(&self, id: &SessionId) -> Result<u8, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or_else(|| SessionError::NotFound(id.clone()))?;
        Ok(quality_score(session))
    }

    pub async fn persist(&self, id: &SessionId) -> Result<(), SessionError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.export(id).await?;
        store.save(&snapshot).await
    }

    /// Removes sessions idle for longer than `threshold`, persisting them first.
    pub async fn evict_idle(&self, threshold: Duration) -> Vec<SessionId> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let idle: Vec<ConversationSession> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<SessionId> = sessions
                .values()
                .filter(|session| session.updated_at < cutoff)
                .map(|session| session.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut evicted = Vec::with_capacity(idle.len());
        for session in idle {
            if let Some(store) = &self.store {
                if let Err(error) = store.save(&SessionSnapshot::of(&session)).await {
                    warn!(
                        event_name = "agent.session.evict_persist_failed",
                        session_id = %session.id,
                        error = %error,
                        "failed to persist idle session before eviction"
                    );
                }
            }
            evicted.push(session.id);
        }

        if !evicted.is_empty() {
            info!(event_name = "agent.session.evicted", count = evicted.len(), "idle sessions evicted");
        }
        evicted
    }

    async fn with_session<T, F>(&self, id: &SessionId, apply: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut ConversationSession) -> Result<T, SessionError>,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| SessionError::NotFound(id.clone()))?;
        let value = apply(session)?;
        session.touch();
        Ok(value)
    }

    async fn with_open_round<F>(&self, id: &SessionId, apply: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut ChatRound) -> Result<(), SessionError>,
    {
        self.with_session(id, |session| {
            let session_id = session.id.clone();
            let round = session
                .last_round_mut()
                .filter(|round| !round.status.is_terminal())
                .ok_or(SessionError::NoOpenRound(session_id))?;
            apply(round)
        })
        .await
    }
}

fn check_snapshot(snapshot: &SessionSnapshot) -> Result<(), SessionError> {
    if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
        return Err(SessionError::UnsupportedSchema {
            found: snapshot.schema_version,
            supported: SNAPSHOT_SCHEMA_VERSION,
        });
    }
    check_round_invariants(&snapshot.session).map_err(SessionError::Domain)
}

/// Rounds are numbered 1..=n, `current_round` is n, n stays within
/// `max_rounds`, and only the last round may still be open.
fn check_round_invariants(session: &ConversationSession) -> Result<(), DomainError> {
    let count = session.rounds.len();
    if session.current_round as usize != count {
        return Err(DomainError::InvariantViolation(format!(
            "current round {} does not match {count} recorded rounds",
            session.current_round
        )));
    }
    if session.max_rounds == 0 || count > session.max_rounds as usize {
        return Err(DomainError::InvariantViolation(format!(
            "{count} rounds exceed the limit of {}",
            session.max_rounds
        )));
    }
    for (index, round) in session.rounds.iter().enumerate() {
        if round.round as usize != index + 1 {
            return Err(DomainError::InvariantViolation(format!(
                "round {} recorded at position {}",
                round.round,
                index + 1
            )));
        }
        if index + 1 < count && !round.status.is_terminal() {
            return Err(DomainError::InvariantViolation(format!(
                "round {} is still open but is not the last round",
                round.round
            )));
        }
    }
    Ok(())
}

pub fn continuation_allowed(session: &ConversationSession) -> bool {
    if session.is_complete || session.at_round_limit() {
        return false;
    }
    match session.last_round() {
        Some(round) => round.made_tool_calls(),
        None => false,
    }
}

/// Model-facing history: user, then assistant (with any tool calls), then one
/// tool message per result.
pub fn session_messages(session: &ConversationSession) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    for round in &session.rounds {
        if !round.user_message.is_empty() {
            messages.push(ChatMessage::user(round.user_message.clone()));
        }

        let reply = round.reply.clone().unwrap_or_default();
        let calls = round.tool_calls.clone().unwrap_or_default();
        if calls.is_empty() {
            if !reply.is_empty() {
                messages.push(ChatMessage::assistant(reply));
            }
            continue;
        }

        messages.push(ChatMessage::assistant_with_tool_calls(reply, calls.clone()));

        let mut used = vec![false; calls.len()];
        for (index, result) in round.tool_results.iter().flatten().enumerate() {
            let matched = calls
                .iter()
                .enumerate()
                .position(|(slot, call)| !used[slot] && call.name == result.tool_name);
            let call_id = match matched {
                Some(slot) => {
                    used[slot] = true;
                    calls[slot].id.clone()
                }
                None => format!("{}-{index}", result.tool_name),
            };
            messages.push(ChatMessage::tool(call_id, result.tool_name.clone(), result_content(result)));
        }
    }

    messages
}

fn result_content(result: &ToolExecutionResult) -> String {
    match (&result.payload, &result.error) {
        (Some(payload), _) if result.success => payload.to_string(),
        (_, Some(error)) => serde_json::json!({ "error": error }).to_string(),
        _ => serde_json::json!({ "error": "tool returned no payload" }).to_string(),
    }
}

/// 0..=100: half for completed rounds, 30% for the absence of errors, 20% for
/// tool usage.
pub fn quality_score(session: &ConversationSession) -> u8 {
    let total = session.rounds.len();
    if total == 0 {
        return 0;
    }

    let total = total as f64;
    let completed =
        session.rounds.iter().filter(|round| round.status == RoundStatus::Complete).count() as f64;
    let errored =
        session.rounds.iter().filter(|round| round.status == RoundStatus::Error).count() as f64;
    let with_tools = session.rounds.iter().filter(|round| round.made_tool_calls()).count() as f64;

    let score = 50.0 * (completed / total) + 30.0 * (1.0 - errored / total) + 20.0 * (with_tools / total);
    score.round().clamp(0.0, 100.0) as u8
}
