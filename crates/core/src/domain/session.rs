use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::chat::ToolCall;
use crate::domain::tool::ToolExecutionResult;
use crate::errors::DomainError;

pub const DEFAULT_MAX_ROUNDS: u32 = 20;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// `pending -> processing -> complete`, with `error` reachable from any open state.
    pub fn transition(self, to: RoundStatus) -> Result<RoundStatus, DomainError> {
        let valid = match (self, to) {
            (Self::Pending, Self::Processing)
            | (Self::Pending, Self::Complete)
            | (Self::Processing, Self::Complete) => true,
            (Self::Pending | Self::Processing, Self::Error) => true,
            (from, to) if from == to && !from.is_terminal() => true,
            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(DomainError::InvalidRoundTransition { from: self, to })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRound {
    pub round: u32,
    pub user_message: String,
    pub reply: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolExecutionResult>>,
    pub status: RoundStatus,
    pub error: Option<String>,
    /// Explicit "needs another turn" signal. Recorded only; continuation still
    /// follows the tool-call heuristic.
    #[serde(default)]
    pub awaiting_input: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatRound {
    pub fn new(round: u32, user_message: impl Into<String>) -> Self {
        Self {
            round,
            user_message: user_message.into(),
            reply: None,
            tool_calls: None,
            tool_results: None,
            status: RoundStatus::Pending,
            error: None,
            awaiting_input: false,
            timestamp: Utc::now(),
        }
    }

    pub fn made_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: SessionId,
    pub owner_id: String,
    pub rounds: Vec<ChatRound>,
    pub current_round: u32,
    pub max_rounds: u32,
    pub is_complete: bool,
    pub final_result: Option<Value>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(id: SessionId, owner_id: impl Into<String>, max_rounds: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: owner_id.into(),
            rounds: Vec::new(),
            current_round: 0,
            max_rounds,
            is_complete: false,
            final_result: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_round(&self) -> Option<&ChatRound> {
        self.rounds.last()
    }

    pub fn last_round_mut(&mut self) -> Option<&mut ChatRound> {
        self.rounds.last_mut()
    }

    pub fn at_round_limit(&self) -> bool {
        self.current_round >= self.max_rounds
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
