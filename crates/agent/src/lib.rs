//! Agent runtime for the Sprout assistant.
//!
//! A turn flows through the crate like this:
//! 1. **Memory** (`memory`) - ranked context across the six memory dimensions
//! 2. **Intent** (`intent`) - rules first, optional model-assisted analysis, cached
//! 3. **Planning and execution** (`orchestrator`, `tools`) - capability routes to an
//!    ordered plan, run strictly one tool at a time with deadlines and retries
//! 4. **Prompting** (`prompt_cache`) - system prompt with organization status and
//!    the tool decision tree, cached per tenant
//! 5. **Reply** (`llm`) - OpenAI-compatible chat completions
//! 6. **State and delivery** (`session`, `stream`) - round bookkeeping and framed
//!    server-sent events
//!
//! `runtime::AgentRuntime` ties the pieces together for one turn.

pub mod cache;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod prompt_cache;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod tools;

pub use runtime::{
    AgentRuntime, CacheSweep, RuntimeConfig, RuntimeError, TurnOutcome, TurnRequest,
};
