//! Query planner agent and execution-plan types.
//!
//! The planner asks the provider (in JSON mode) to decompose the user's
//! query into an [`ExecutionPlan`], then declares which agent should run
//! next: the parallel searcher for multi-query parallel plans, otherwise
//! the retrieval, researcher, or writer agent. Parsing is defensive — a
//! malformed plan degrades to a single sub-query over the raw user query
//! instead of failing the turn.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agentstream::agents::{
    Agent, AgentItem, AgentStream, Handoff, HandoffPayload, TurnConfig,
};
use crate::agentstream::event::{AgentContext, ContentType, ErrorCode, StreamEvent};
use crate::agentstream::llm::{CompletionOptions, LlmClient};

/// Upper bound on sub-queries a plan may carry.
pub const MAX_SUB_QUERIES: usize = 5;

/// System prompt for the planning completion. The mock provider keys on
/// the "query planner" phrase.
const PLANNER_PROMPT: &str = "You are a query planner for a multi-agent assistant. \
Decompose the user's request into an execution plan. Respond with a single JSON object:\n\
{\"original_query\": string, \"query_type\": \"simple\"|\"complex\"|\"multi-part\", \
\"sub_queries\": [{\"id\": \"sq-1\", \"query\": string, \
\"intent\": \"factual\"|\"comparative\"|\"procedural\"|\"exploratory\", \
\"priority\": 1-5, \"search_strategy\": \"semantic\"|\"keyword\"|\"hybrid\"}], \
\"requires_research\": bool, \"requires_rag\": bool, \
\"parallel_execution\": bool, \"reasoning\": string}\n\
Use at most five sub-queries.";

/// Classification of the incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    #[serde(rename = "simple")]
    Simple,
    #[serde(rename = "complex")]
    Complex,
    #[serde(rename = "multi-part")]
    MultiPart,
}

/// Retrieval intent of a sub-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Factual,
    Comparative,
    Procedural,
    Exploratory,
}

/// Search strategy hint forwarded to the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Semantic,
    Keyword,
    Hybrid,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Semantic => "semantic",
            SearchStrategy::Keyword => "keyword",
            SearchStrategy::Hybrid => "hybrid",
        }
    }
}

/// A planner-produced narrower question, executed alongside its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    pub id: String,
    pub query: String,
    pub intent: QueryIntent,
    /// 1 (highest) to 5.
    pub priority: u8,
    pub search_strategy: SearchStrategy,
}

/// The planner's output for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub original_query: String,
    pub query_type: QueryType,
    pub sub_queries: Vec<SubQuery>,
    pub requires_research: bool,
    pub requires_rag: bool,
    pub parallel_execution: bool,
    pub reasoning: String,
}

impl ExecutionPlan {
    /// Single-subquery plan over the raw query, used when the provider's
    /// plan cannot be parsed.
    pub fn fallback(query: &str) -> Self {
        Self {
            original_query: query.to_string(),
            query_type: QueryType::Simple,
            sub_queries: vec![SubQuery {
                id: "sq-1".to_string(),
                query: query.to_string(),
                intent: QueryIntent::Factual,
                priority: 1,
                search_strategy: SearchStrategy::Semantic,
            }],
            requires_research: false,
            requires_rag: false,
            parallel_execution: false,
            reasoning: "fallback plan: provider output was not a valid plan".to_string(),
        }
    }

    /// Parse a provider response defensively.
    ///
    /// Strips markdown code fences, tolerates surrounding prose by scanning
    /// for the outermost JSON object, clamps the sub-query count, and
    /// normalizes priorities into 1..=5. Anything unparseable yields
    /// [`ExecutionPlan::fallback`].
    pub fn parse_defensive(raw: &str, query: &str) -> Self {
        let candidate = extract_json_object(raw);
        let mut plan: ExecutionPlan = match serde_json::from_str(candidate) {
            Ok(plan) => plan,
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("ExecutionPlan::parse_defensive: malformed plan ({})", e);
                }
                return Self::fallback(query);
            }
        };
        if plan.sub_queries.is_empty() {
            return Self::fallback(query);
        }
        plan.sub_queries.truncate(MAX_SUB_QUERIES);
        for sub in &mut plan.sub_queries {
            sub.priority = sub.priority.clamp(1, 5);
        }
        plan
    }

    /// Registry name of the agent that should run after planning.
    pub fn handoff_target(&self) -> &'static str {
        if self.sub_queries.len() > 1 && self.parallel_execution {
            "parallel-search"
        } else if self.requires_research {
            "researcher"
        } else if self.requires_rag {
            "rag"
        } else {
            "writer"
        }
    }
}

/// Slice out the outermost `{...}` of a response that may wrap JSON in
/// code fences or prose.
fn extract_json_object(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = match trimmed.find('{') {
        Some(idx) => idx,
        None => return trimmed,
    };
    let end = match trimmed.rfind('}') {
        Some(idx) if idx >= start => idx,
        _ => return trimmed,
    };
    &trimmed[start..=end]
}

pub struct PlannerAgent {
    client: Arc<dyn LlmClient>,
}

impl PlannerAgent {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl Agent for PlannerAgent {
    fn name(&self) -> &str {
        "PlannerAgent"
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let client = self.client.clone();
        let name = self.name().to_string();

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));
            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::Thoughts,
                Some("planning".to_string()),
            ));

            let query = ctx.latest_user_message().to_string();
            let mut options = CompletionOptions::planner();
            options.system_prompt = Some(PLANNER_PROMPT.to_string());

            let completion = tokio::select! {
                _ = turn.abort.cancelled() => return,
                result = client.complete(&ctx.message_history, &options) => result,
            };

            let plan = match completion {
                Ok(raw) => ExecutionPlan::parse_defensive(&raw, &query),
                Err(e) if e.code == ErrorCode::Timeout => {
                    yield AgentItem::event(StreamEvent::error(ErrorCode::Timeout, e.message));
                    return;
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("PlannerAgent: completion failed: {}", e);
                    }
                    yield AgentItem::event(StreamEvent::error(e.code, e.message));
                    return;
                }
            };

            yield AgentItem::event(StreamEvent::data(format!(
                "Planned {} sub-quer{} ({:?}).\n",
                plan.sub_queries.len(),
                if plan.sub_queries.len() == 1 { "y" } else { "ies" },
                plan.query_type,
            )));

            let target = plan.handoff_target().to_string();
            let reason = plan.reasoning.clone();
            yield AgentItem::Handoff(Handoff {
                target,
                reason,
                payload: HandoffPayload {
                    plan: Some(plan),
                    ..HandoffPayload::default()
                },
            });

            yield AgentItem::event(StreamEvent::done());
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defensive_parse_strips_fences() {
        let raw = "```json\n{\"original_query\":\"q\",\"query_type\":\"simple\",\
                   \"sub_queries\":[{\"id\":\"sq-1\",\"query\":\"q\",\"intent\":\"factual\",\
                   \"priority\":9,\"search_strategy\":\"semantic\"}],\
                   \"requires_research\":false,\"requires_rag\":false,\
                   \"parallel_execution\":false,\"reasoning\":\"r\"}\n```";
        let plan = ExecutionPlan::parse_defensive(raw, "q");
        assert_eq!(plan.sub_queries.len(), 1);
        // out-of-range priority is clamped, not rejected
        assert_eq!(plan.sub_queries[0].priority, 5);
    }

    #[test]
    fn malformed_plan_falls_back_to_single_subquery() {
        let plan = ExecutionPlan::parse_defensive("not json at all", "what is rust?");
        assert_eq!(plan.query_type, QueryType::Simple);
        assert_eq!(plan.sub_queries.len(), 1);
        assert_eq!(plan.sub_queries[0].query, "what is rust?");
    }

    #[test]
    fn handoff_targets() {
        let mut plan = ExecutionPlan::fallback("q");
        assert_eq!(plan.handoff_target(), "writer");

        plan.requires_rag = true;
        assert_eq!(plan.handoff_target(), "rag");

        plan.requires_research = true;
        assert_eq!(plan.handoff_target(), "researcher");

        plan.parallel_execution = true;
        plan.sub_queries.push(plan.sub_queries[0].clone());
        assert_eq!(plan.handoff_target(), "parallel-search");
    }
}
