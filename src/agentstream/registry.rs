//! Name → agent registry.
//!
//! Agents are registered once at startup and looked up by name for every
//! turn. Registration is idempotent per name (re-registering replaces the
//! prior entry) and lookup is O(1). An unknown name yields the typed
//! [`NotRegistered`] error, which the controller translates to a 4xx before
//! any event is written.
//!
//! The map is read-heavy: writes happen only during startup wiring, so a
//! `std::sync::RwLock` suffices.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agentstream::agents::plain::PlainAgent;
//! use agentstream::registry::AgentRegistry;
//! # fn client() -> Arc<dyn agentstream::llm::LlmClient> { unimplemented!() }
//!
//! let registry = AgentRegistry::new();
//! registry.register("normal", Arc::new(PlainAgent::new(client())));
//! assert!(registry.has("normal"));
//! assert_eq!(registry.list(), vec!["normal".to_string()]);
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::agentstream::agents::Agent;

/// Error returned by [`AgentRegistry::get`] for unknown names.
#[derive(Debug, Clone)]
pub struct NotRegistered {
    /// The name that failed to resolve.
    pub name: String,
}

impl fmt::Display for NotRegistered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no agent registered under '{}'", self.name)
    }
}

impl Error for NotRegistered {}

/// Process-wide registry of named agents.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register `agent` under `name`, replacing any prior entry.
    pub fn register(&self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        let name = name.into();
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("AgentRegistry::register: '{}'", name);
        }
        self.agents.write().expect("registry lock poisoned").insert(name, agent);
    }

    /// Resolve `name` to its agent.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>, NotRegistered> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| NotRegistered {
                name: name.to_string(),
            })
    }

    /// `true` when `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.agents.read().expect("registry lock poisoned").contains_key(name)
    }

    /// Sorted list of registered names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentstream::agents::{Agent, AgentItem, AgentStream, TurnConfig};
    use crate::agentstream::event::AgentContext;

    struct NullAgent;

    impl Agent for NullAgent {
        fn name(&self) -> &str {
            "NullAgent"
        }

        fn run(&self, _ctx: AgentContext, _turn: TurnConfig) -> AgentStream {
            Box::pin(futures_util::stream::empty::<AgentItem>())
        }
    }

    #[test]
    fn unknown_name_is_typed_error() {
        let registry = AgentRegistry::new();
        let err = match registry.get("missing") {
            Ok(_) => panic!("expected NotRegistered error"),
            Err(e) => e,
        };
        assert_eq!(err.name, "missing");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn reregistering_replaces() {
        let registry = AgentRegistry::new();
        registry.register("a", Arc::new(NullAgent));
        registry.register("a", Arc::new(NullAgent));
        assert_eq!(registry.list().len(), 1);
    }
}
