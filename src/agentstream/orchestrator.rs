//! Multi-agent flow coordination.
//!
//! The orchestrator is itself an [`Agent`] (registered under
//! `multi-agent`): it owns the outer event stream of a turn and chains
//! inner agents by handoff. The planner runs first; its plan decides the
//! downstream flow — parallel search → ranker → writer for parallel
//! multi-query plans, researcher/rag → writer for grounded plans, writer
//! alone otherwise.
//!
//! Boundary rules:
//!
//! - inner `metadata` and `done` events are consumed, never re-emitted;
//!   everything else is forwarded verbatim;
//! - an inner `error` is forwarded and ends the outer stream;
//! - each phase transition is announced by one orchestrator-authored
//!   `data` marker — the only content the orchestrator generates itself;
//! - handoff targets resolve through the registry; an unknown name ends
//!   the stream with `error{AGENT_ERROR}`;
//! - a max-iteration cap (default 6) breaks handoff cycles: hitting it
//!   emits a sentinel `data` and terminates with `done`.

use futures_util::StreamExt;
use std::sync::Arc;

use crate::agentstream::agents::{
    Agent, AgentItem, AgentStream, Handoff, HandoffPayload, TurnConfig,
};
use crate::agentstream::event::{AgentContext, ErrorCode, StreamEvent};
use crate::agentstream::registry::AgentRegistry;

/// Default bound on chained agent runs per turn.
pub const DEFAULT_MAX_ITERATIONS: usize = 6;

/// Registry name of the planning phase.
const PLANNER: &str = "planner";
/// Registry name of the final phase; the chain always ends here.
const WRITER: &str = "writer";

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    max_iterations: usize,
}

impl Orchestrator {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Override the handoff-cycle cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }
}

/// What one inner phase produced, as seen at the boundary.
enum PhaseOutcome {
    /// Agent finished; it may have declared a handoff.
    Finished(Option<Handoff>),
    /// Agent emitted a terminal error (already forwarded).
    Failed,
    /// The turn was aborted mid-phase.
    Aborted,
}

impl Agent for Orchestrator {
    fn name(&self) -> &str {
        "Orchestrator"
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let registry = self.registry.clone();
        let max_iterations = self.max_iterations;

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));

            let mut next = Some(Handoff {
                target: PLANNER.to_string(),
                reason: "plan the turn".to_string(),
                payload: HandoffPayload::default(),
            });
            let mut iterations = 0usize;

            while let Some(handoff) = next.take() {
                if turn.abort.is_cancelled() {
                    return;
                }
                if iterations >= max_iterations {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(
                            "Orchestrator: handoff cap ({}) hit on thread {}",
                            max_iterations,
                            ctx.thread_id
                        );
                    }
                    yield AgentItem::event(StreamEvent::data(
                        "Stopping: agent handoff limit reached.\n",
                    ));
                    break;
                }
                iterations += 1;

                let agent = match registry.get(&handoff.target) {
                    Ok(agent) => agent,
                    Err(e) => {
                        yield AgentItem::event(StreamEvent::error(
                            ErrorCode::AgentError,
                            e.to_string(),
                        ));
                        return;
                    }
                };

                // Phase marker: the only orchestrator-authored content.
                if handoff.target != PLANNER {
                    yield AgentItem::event(StreamEvent::data(format!(
                        "— {} —\n",
                        agent.name()
                    )));
                }

                let phase_turn = TurnConfig {
                    baton: handoff.payload.clone(),
                    ..turn.clone()
                };
                let mut inner = agent.run(ctx.clone(), phase_turn);
                let mut outcome = PhaseOutcome::Finished(None);
                let mut captured: Option<Handoff> = None;

                loop {
                    let item = tokio::select! {
                        _ = turn.abort.cancelled() => {
                            outcome = PhaseOutcome::Aborted;
                            break;
                        }
                        item = inner.next() => item,
                    };
                    match item {
                        Some(AgentItem::Event(event)) => match event {
                            // Boundary filter: inner metadata/done are
                            // consumed here.
                            StreamEvent::Metadata { .. } => {}
                            StreamEvent::Done { .. } => {}
                            StreamEvent::Error { .. } => {
                                yield AgentItem::Event(event);
                                outcome = PhaseOutcome::Failed;
                                break;
                            }
                            other => {
                                yield AgentItem::Event(other);
                            }
                        },
                        Some(AgentItem::Handoff(handoff)) => {
                            captured = Some(handoff);
                        }
                        None => {
                            outcome = PhaseOutcome::Finished(captured.take());
                            break;
                        }
                    }
                }

                match outcome {
                    PhaseOutcome::Finished(declared) => {
                        next = match declared {
                            Some(handoff) => Some(handoff),
                            // A phase with no declared successor still
                            // owes the user an answer; chain to the
                            // writer unless it just ran.
                            None if handoff.target != WRITER => Some(Handoff {
                                target: WRITER.to_string(),
                                reason: "finalize the answer".to_string(),
                                payload: handoff.payload,
                            }),
                            None => None,
                        };
                    }
                    PhaseOutcome::Failed => return,
                    PhaseOutcome::Aborted => return,
                }
            }

            if turn.abort.is_cancelled() {
                return;
            }
            yield AgentItem::event(StreamEvent::done());
        };
        Box::pin(stream)
    }
}
