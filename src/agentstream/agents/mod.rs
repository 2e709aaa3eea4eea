//! Agents: independent event producers behind a common operation.
//!
//! Every agent implements [`Agent::run`], which turns a per-turn
//! [`AgentContext`] into a lazy sequence of [`AgentItem`]s. The wire
//! contract is uniform: a `metadata` event first, zero or more
//! `agent_updated`/`data` events in between, and exactly one terminal
//! `done` or `error`. Agents that want execution to continue elsewhere
//! yield a [`Handoff`] control item — a value, not a callback — which the
//! orchestrator consumes at the boundary and never frames onto the wire.
//!
//! # Agents
//!
//! | Agent | Role |
//! |-------|------|
//! | [`plain::PlainAgent`] | Forward provider tokens for a plain turn. |
//! | [`rag::RagAgent`] | Retrieval-grounded reply with citations. |
//! | [`planner::PlannerAgent`] | Produce an execution plan, declare a handoff. |
//! | [`parallel_search::ParallelSearchAgent`] | Fan out sub-queries concurrently. |
//! | [`ranker::ResultRankerAgent`] | Score and select search findings. |
//! | [`writer::WriterAgent`] | Stream the final answer from plan + findings. |
//!
//! All agents observe the per-turn abort token at every suspension point:
//! when it fires they terminate their local loop and end without emitting
//! further events.

pub mod parallel_search;
pub mod plain;
pub mod planner;
pub mod rag;
pub mod ranker;
pub mod writer;

use futures_util::stream::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::agentstream::event::{AgentContext, StreamEvent};
use crate::agentstream::llm::{TokenChunk, TokenStream};

/// One item of an agent's output sequence: a wire event, or a control-plane
/// handoff consumed by the orchestrator.
#[derive(Debug, Clone)]
pub enum AgentItem {
    Event(StreamEvent),
    Handoff(Handoff),
}

impl AgentItem {
    /// Convenience constructor wrapping a wire event.
    pub fn event(event: StreamEvent) -> Self {
        AgentItem::Event(event)
    }
}

/// Type alias for the lazy event sequence produced by [`Agent::run`].
pub type AgentStream = Pin<Box<dyn Stream<Item = AgentItem> + Send>>;

/// An agent's declaration that execution should continue in another named
/// agent after it ends.
#[derive(Debug, Clone)]
pub struct Handoff {
    /// Registry name of the next agent.
    pub target: String,
    /// Human-readable explanation, logged by the orchestrator.
    pub reason: String,
    /// Structured outputs carried to the next agent.
    pub payload: HandoffPayload,
}

/// The baton passed between phases of a multi-agent flow.
///
/// Fields accumulate as the flow progresses: the planner fills `plan`, the
/// parallel searcher adds `search`, the ranker adds `findings`.
#[derive(Debug, Clone, Default)]
pub struct HandoffPayload {
    pub plan: Option<planner::ExecutionPlan>,
    pub search: Option<parallel_search::ParallelSearchResults>,
    pub findings: Option<ranker::RankedFindings>,
}

/// Per-invocation configuration handed to [`Agent::run`] alongside the
/// context.
#[derive(Clone)]
pub struct TurnConfig {
    /// Upper bound on generated tokens, forwarded to the provider.
    pub max_tokens: Option<u32>,
    /// Sampling temperature; see [`TurnConfig::with_style`].
    pub temperature: Option<f32>,
    /// Overrides the agent's default system prompt.
    pub system_prompt: Option<String>,
    /// Fired when the client stops the turn or the service shuts down.
    pub abort: CancellationToken,
    /// Outputs of upstream agents in a multi-agent flow.
    pub baton: HandoffPayload,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            system_prompt: None,
            abort: CancellationToken::new(),
            baton: HandoffPayload::default(),
        }
    }
}

impl TurnConfig {
    /// Attach the turn's abort token.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Map a conversation style onto a sampling temperature. An explicit
    /// temperature set earlier wins.
    pub fn with_style(mut self, style: &str) -> Self {
        if self.temperature.is_none() {
            self.temperature = Some(match style {
                "creative" => 0.95,
                "precise" => 0.2,
                _ => 0.7,
            });
        }
        self
    }
}

/// A named event producer.
///
/// `run` takes the context by value; agents never mutate shared state
/// through it. Implementations build their sequence lazily (typically with
/// `async_stream`) so nothing happens until the consumer polls.
pub trait Agent: Send + Sync {
    /// Display name used in `agent_updated` events (e.g. `"PlainAgent"`).
    fn name(&self) -> &str;

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream;
}

/// Await the next token unless the turn is aborted first.
///
/// Returns `None` when the stream is exhausted *or* the token fired;
/// callers that care can distinguish via `abort.is_cancelled()`.
pub(crate) async fn next_token(
    tokens: &mut TokenStream,
    abort: &CancellationToken,
) -> Option<TokenChunk> {
    tokio::select! {
        _ = abort.cancelled() => None,
        chunk = tokens.next() => chunk,
    }
}
