use std::path::PathBuf;

use serde::Serialize;
use sprout_agent::session::{
    quality_score, session_messages, FileSessionStore, SessionError, SessionSnapshot, SessionStore,
};
use sprout_core::config::{AppConfig, LoadOptions};
use sprout_core::domain::session::{RoundStatus, SessionId};

use crate::commands::CommandResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAction {
    List,
    Inspect(String),
    Export(String),
}

#[derive(Debug, Serialize)]
struct SessionList {
    storage_dir: String,
    sessions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RoundSummary {
    round: u32,
    status: RoundStatus,
    tool_calls: usize,
    failed_tools: usize,
    awaiting_input: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    id: String,
    owner_id: String,
    schema_version: u32,
    current_round: u32,
    max_rounds: u32,
    is_complete: bool,
    quality_score: u8,
    message_count: usize,
    updated_at: String,
    rounds: Vec<RoundSummary>,
}

/// Reads persisted sessions. `dir` overrides `sessions.storage_dir`.
pub fn run(action: SessionAction, dir: Option<PathBuf>) -> CommandResult {
    let dir = match dir {
        Some(dir) => dir,
        None => match AppConfig::load(LoadOptions::default()) {
            Ok(config) => config.sessions.storage_dir,
            Err(error) => {
                return CommandResult::failure(
                    "session",
                    "config_validation",
                    format!("configuration issue: {error}"),
                    2,
                );
            }
        },
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "session",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let store = FileSessionStore::new(dir);
    runtime.block_on(async {
        match action {
            SessionAction::List => match store.list().await {
                Ok(ids) => CommandResult::data(
                    "session",
                    SessionList {
                        storage_dir: store.dir().display().to_string(),
                        sessions: ids.into_iter().map(|id| id.0).collect(),
                    },
                ),
                Err(error) => storage_failure(error),
            },
            SessionAction::Inspect(id) => match load(&store, id).await {
                Ok(snapshot) => CommandResult::data("session", summarize(&snapshot)),
                Err(result) => result,
            },
            SessionAction::Export(id) => match load(&store, id).await {
                Ok(snapshot) => CommandResult::data("session", snapshot),
                Err(result) => result,
            },
        }
    })
}

async fn load(store: &FileSessionStore, id: String) -> Result<SessionSnapshot, CommandResult> {
    match store.load(&SessionId(id.clone())).await {
        Ok(Some(snapshot)) => Ok(snapshot),
        Ok(None) => Err(CommandResult::failure(
            "session",
            "not_found",
            format!("no stored session `{id}` in `{}`", store.dir().display()),
            4,
        )),
        Err(error) => Err(storage_failure(error)),
    }
}

fn storage_failure(error: SessionError) -> CommandResult {
    let error_class = match error {
        SessionError::InvalidId(_) => "invalid_input",
        _ => "session_storage",
    };
    CommandResult::failure("session", error_class, error.to_string(), 5)
}

fn summarize(snapshot: &SessionSnapshot) -> SessionSummary {
    let session = &snapshot.session;
    SessionSummary {
        id: session.id.0.clone(),
        owner_id: session.owner_id.clone(),
        schema_version: snapshot.schema_version,
        current_round: session.current_round,
        max_rounds: session.max_rounds,
        is_complete: session.is_complete,
        quality_score: quality_score(session),
        message_count: session_messages(session).len(),
        updated_at: session.updated_at.to_rfc3339(),
        rounds: session
            .rounds
            .iter()
            .map(|round| RoundSummary {
                round: round.round,
                status: round.status,
                tool_calls: round.tool_calls.as_ref().map_or(0, Vec::len),
                failed_tools: round
                    .tool_results
                    .as_ref()
                    .map_or(0, |results| results.iter().filter(|result| !result.success).count()),
                awaiting_input: round.awaiting_input,
                error: round.error.clone(),
            })
            .collect(),
    }
}
