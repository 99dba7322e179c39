pub mod config;
pub mod domain;
pub mod errors;

pub use domain::chat::{ChatMessage, ChatRole, ToolCall};
pub use domain::intent::{AnalysisSource, Capability, Complexity, IntentAnalysis, IntentType};
pub use domain::memory::{MemoryDimension, MemoryItem, MemoryStore};
pub use domain::organization::{DataCategory, OrganizationStats, OrganizationStatsSource};
pub use domain::session::{ChatRound, ConversationSession, RoundStatus, SessionId};
pub use domain::tool::{ExecutionPlan, ToolExecutionResult, ToolSpec};
pub use errors::{ApplicationError, DomainError, InterfaceError};
