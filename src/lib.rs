// src/lib.rs

// Import the top-level `agentstream` module.
pub mod agentstream;

// Re-export the component modules at the crate root so callers write
// agentstream::event::StreamEvent rather than agentstream::agentstream::event::StreamEvent.
pub use agentstream::{
    abort, agents, config, controller, conversation, event, llm, orchestrator, registry,
    repository, search, sse,
};
pub use agentstream::registry::AgentRegistry;

/// Initialise env_logger once for binaries and tests. Safe to call
/// repeatedly; later calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::try_init();
}
