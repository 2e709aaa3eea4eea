//! Scoring and selection over parallel search findings.
//!
//! When a provider is configured and the plan carried more than one
//! sub-query, the ranker asks the model (JSON mode) to score the
//! sub-queries; otherwise — and whenever the model's output cannot be
//! parsed — it falls back to a deterministic heuristic:
//!
//! ```text
//! score = 0.5·relevance + 0.3·min(docs/5, 1) + (0.2 if no error)
//! ```
//!
//! Up to three results meeting `score >= 0.3` are selected; when none
//! qualify, the single best non-empty result is forced so the writer
//! always has something to ground on. The selected sub-queries are
//! synthesized into a context string of ids, queries, and document
//! excerpts that rides the handoff to the writer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agentstream::agents::parallel_search::{ParallelSearchResults, SubQueryResult};
use crate::agentstream::agents::{
    Agent, AgentItem, AgentStream, Handoff, HandoffPayload, TurnConfig,
};
use crate::agentstream::event::{AgentContext, ContentType, ErrorCode, StreamEvent};
use crate::agentstream::llm::{CompletionOptions, LlmClient};

/// Maximum results selected for synthesis.
const MAX_SELECTED: usize = 3;
/// Scores below this bar are dropped (unless nothing clears it).
const SCORE_BAR: f64 = 0.3;
/// Characters of each document included in the synthesized context.
const EXCERPT_CHARS: usize = 500;

/// System prompt for the ranking completion. The mock provider keys on
/// the "result ranker" phrase.
const RANKER_PROMPT: &str = "You are a result ranker. Score each candidate sub-query's \
search results for usefulness in answering the original question. Respond with a single \
JSON object: {\"rankings\": [{\"id\": string, \"score\": number 0-1}], \"reasoning\": string}.";

/// One selected sub-query with its final score.
#[derive(Debug, Clone)]
pub struct SelectedResult {
    pub sub_query_id: String,
    pub score: f64,
}

/// The ranker's output, carried to the writer.
#[derive(Debug, Clone)]
pub struct RankedFindings {
    pub selected: Vec<SelectedResult>,
    /// Synthesized context block the writer grounds on.
    pub context: String,
    /// Average selected score plus a small selection bonus, ≤ 1.
    pub confidence: f64,
}

pub struct ResultRankerAgent {
    client: Option<Arc<dyn LlmClient>>,
}

impl ResultRankerAgent {
    pub fn new(client: Option<Arc<dyn LlmClient>>) -> Self {
        Self { client }
    }

    /// Deterministic score for one sub-query outcome.
    fn heuristic_score(result: &SubQueryResult) -> f64 {
        let doc_factor = (result.documents.len() as f64 / 5.0).min(1.0);
        let error_bonus = if result.error.is_none() { 0.2 } else { 0.0 };
        0.5 * result.relevance + 0.3 * doc_factor + error_bonus
    }

    /// Ask the model for scores; `None` when the response is unusable.
    async fn model_scores(
        client: &Arc<dyn LlmClient>,
        ctx: &AgentContext,
        search: &ParallelSearchResults,
    ) -> Option<HashMap<String, f64>> {
        let mut prompt = String::from("Candidates:\n");
        for result in &search.results {
            prompt.push_str(&format!(
                "- {} \"{}\": {} document(s), relevance {:.2}{}\n",
                result.sub_query.id,
                result.sub_query.query,
                result.documents.len(),
                result.relevance,
                if result.error.is_some() { ", failed" } else { "" },
            ));
        }
        prompt.push_str(&format!("Original question: {}\n", ctx.latest_user_message()));

        let mut options = CompletionOptions::ranker();
        options.system_prompt = Some(format!("{}\n{}", RANKER_PROMPT, prompt));

        let raw = match client.complete(&ctx.message_history, &options).await {
            Ok(raw) => raw,
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("ResultRankerAgent: model ranking failed ({}), using heuristic", e);
                }
                return None;
            }
        };
        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
        let rankings = parsed.get("rankings")?.as_array()?;
        let mut scores = HashMap::new();
        for entry in rankings {
            if let (Some(id), Some(score)) = (
                entry.get("id").and_then(|v| v.as_str()),
                entry.get("score").and_then(|v| v.as_f64()),
            ) {
                scores.insert(id.to_string(), score.clamp(0.0, 1.0));
            }
        }
        if scores.is_empty() {
            None
        } else {
            Some(scores)
        }
    }

    /// Score, select, and synthesize.
    fn select(
        search: &ParallelSearchResults,
        model_scores: Option<&HashMap<String, f64>>,
    ) -> RankedFindings {
        let mut scored: Vec<(&SubQueryResult, f64)> = search
            .results
            .iter()
            .map(|result| {
                let score = model_scores
                    .and_then(|scores| scores.get(&result.sub_query.id).copied())
                    .unwrap_or_else(|| Self::heuristic_score(result));
                (result, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut picked: Vec<&(&SubQueryResult, f64)> = scored
            .iter()
            .filter(|(result, score)| *score >= SCORE_BAR && !result.documents.is_empty())
            .take(MAX_SELECTED)
            .collect();

        if picked.is_empty() {
            // Force the best non-empty result so the writer has grounding.
            if let Some(best) = scored.iter().find(|(result, _)| !result.documents.is_empty()) {
                picked.push(best);
            }
        }

        let mut context = String::new();
        let mut selected = Vec::with_capacity(picked.len());
        for (result, score) in picked.iter().map(|entry| (entry.0, entry.1)) {
            context.push_str(&format!(
                "## {} — {}\n",
                result.sub_query.id, result.sub_query.query
            ));
            for doc in &result.documents {
                let excerpt: String = doc.content.chars().take(EXCERPT_CHARS).collect();
                context.push_str(&format!("### {}\n{}\n", doc.title, excerpt));
            }
            selected.push(SelectedResult {
                sub_query_id: result.sub_query.id.clone(),
                score,
            });
        }

        let confidence = if selected.is_empty() {
            0.0
        } else {
            let avg: f64 =
                selected.iter().map(|s| s.score).sum::<f64>() / selected.len() as f64;
            (avg + (0.1 * selected.len() as f64).min(0.2)).min(1.0)
        };

        RankedFindings {
            selected,
            context,
            confidence,
        }
    }
}

impl Agent for ResultRankerAgent {
    fn name(&self) -> &str {
        "ResultRankerAgent"
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let client = self.client.clone();
        let name = self.name().to_string();

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));

            let search = match turn.baton.search.clone() {
                Some(search) => search,
                None => {
                    yield AgentItem::event(StreamEvent::error(
                        ErrorCode::AgentError,
                        "ranker invoked without search results",
                    ));
                    return;
                }
            };

            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::Thoughts,
                Some("ranking results".to_string()),
            ));

            // Model-assisted ranking only pays off with competing
            // sub-queries; otherwise the heuristic decides alone.
            let model_scores = match &client {
                Some(client) if search.results.len() > 1 => tokio::select! {
                    _ = turn.abort.cancelled() => return,
                    scores = Self::model_scores(client, &ctx, &search) => scores,
                },
                _ => None,
            };

            let findings = Self::select(&search, model_scores.as_ref());
            yield AgentItem::event(StreamEvent::data(format!(
                "Selected {} result set(s), confidence {:.2}.\n",
                findings.selected.len(),
                findings.confidence,
            )));

            yield AgentItem::Handoff(Handoff {
                target: "writer".to_string(),
                reason: "findings ranked".to_string(),
                payload: HandoffPayload {
                    plan: turn.baton.plan.clone(),
                    search: Some(search),
                    findings: Some(findings),
                },
            });

            yield AgentItem::event(StreamEvent::done());
        };
        Box::pin(stream)
    }
}
