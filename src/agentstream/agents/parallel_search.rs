//! Concurrent sub-query execution.
//!
//! Fans every sub-query of the plan out to the search collaborator at
//! once with wait-all-settled semantics: one sub-query's failure never
//! cancels its siblings. Documents are aggregated by id (first occurrence
//! wins), each sub-query gets a normalized relevance in [0, 1], and the
//! whole [`ParallelSearchResults`] rides the handoff to the ranker — or
//! straight to the writer when nothing was retrieved.

use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

use crate::agentstream::agents::planner::SubQuery;
use crate::agentstream::agents::{
    Agent, AgentItem, AgentStream, Handoff, HandoffPayload, TurnConfig,
};
use crate::agentstream::event::{AgentContext, ContentType, ErrorCode, StreamEvent};
use crate::agentstream::search::{Document, SearchOptions, SearchProvider};

/// Documents requested per sub-query.
const DOCS_PER_SUB_QUERY: usize = 5;

/// Outcome of one sub-query.
#[derive(Debug, Clone)]
pub struct SubQueryResult {
    pub sub_query: SubQuery,
    /// Documents retrieved for this sub-query, minus ids already claimed
    /// by an earlier sub-query.
    pub documents: Vec<Document>,
    /// `clamp(avg_score / relevance_scale)` over the raw hits, in [0, 1].
    pub relevance: f64,
    /// Collaborator failure for this sub-query, when one occurred.
    pub error: Option<String>,
}

/// Aggregate outcome of a parallel search phase.
#[derive(Debug, Clone)]
pub struct ParallelSearchResults {
    pub results: Vec<SubQueryResult>,
    /// Size of the union of retrieved document ids.
    pub total_documents: usize,
    /// Sub-query with the highest relevance among those with at least one
    /// document.
    pub best_sub_query_id: Option<String>,
}

pub struct ParallelSearchAgent {
    search: Option<Arc<dyn SearchProvider>>,
    relevance_scale: f64,
}

impl ParallelSearchAgent {
    pub fn new(search: Option<Arc<dyn SearchProvider>>, relevance_scale: f64) -> Self {
        Self {
            search,
            relevance_scale: if relevance_scale > 0.0 {
                relevance_scale
            } else {
                10.0
            },
        }
    }

    /// Run every sub-query concurrently and aggregate.
    async fn execute(
        &self,
        provider: &Arc<dyn SearchProvider>,
        sub_queries: &[SubQuery],
    ) -> ParallelSearchResults {
        let searches = sub_queries.iter().map(|sub| {
            let provider = provider.clone();
            let sub = sub.clone();
            async move {
                let options = SearchOptions {
                    top_k: DOCS_PER_SUB_QUERY,
                    strategy: Some(sub.search_strategy.as_str().to_string()),
                };
                let outcome = provider.search(&sub.query, &options).await;
                (sub, outcome)
            }
        });

        // join_all settles every future; failures stay per-sub-query.
        let settled = join_all(searches).await;

        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut results = Vec::with_capacity(settled.len());
        for (sub, outcome) in settled {
            match outcome {
                Ok(raw_docs) => {
                    let relevance = if raw_docs.is_empty() {
                        0.0
                    } else {
                        let avg: f64 = raw_docs.iter().map(|d| d.score).sum::<f64>()
                            / raw_docs.len() as f64;
                        (avg / self.relevance_scale).clamp(0.0, 1.0)
                    };
                    let documents: Vec<Document> = raw_docs
                        .into_iter()
                        .filter(|d| seen_ids.insert(d.id.clone()))
                        .collect();
                    results.push(SubQueryResult {
                        sub_query: sub,
                        documents,
                        relevance,
                        error: None,
                    });
                }
                Err(e) => {
                    results.push(SubQueryResult {
                        sub_query: sub,
                        documents: Vec::new(),
                        relevance: 0.0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let best_sub_query_id = results
            .iter()
            .filter(|r| !r.documents.is_empty())
            .max_by(|a, b| {
                a.relevance
                    .partial_cmp(&b.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|r| r.sub_query.id.clone());

        ParallelSearchResults {
            total_documents: seen_ids.len(),
            results,
            best_sub_query_id,
        }
    }
}

impl Agent for ParallelSearchAgent {
    fn name(&self) -> &str {
        "ParallelSearchAgent"
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let agent = ParallelSearchAgent {
            search: self.search.clone(),
            relevance_scale: self.relevance_scale,
        };
        let name = self.name().to_string();

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));

            let plan = match turn.baton.plan.clone() {
                Some(plan) => plan,
                None => {
                    yield AgentItem::event(StreamEvent::error(
                        ErrorCode::AgentError,
                        "parallel search invoked without an execution plan",
                    ));
                    return;
                }
            };

            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::Thoughts,
                Some(format!("searching {} sub-queries", plan.sub_queries.len())),
            ));

            let provider = match agent.search.clone() {
                Some(provider) => provider,
                None => {
                    // Without a collaborator there is nothing to retrieve;
                    // hand the plan straight to the writer.
                    yield AgentItem::event(StreamEvent::data(
                        "No search backend configured; skipping retrieval.\n",
                    ));
                    yield AgentItem::Handoff(Handoff {
                        target: "writer".to_string(),
                        reason: "no search backend".to_string(),
                        payload: HandoffPayload {
                            plan: Some(plan),
                            ..HandoffPayload::default()
                        },
                    });
                    yield AgentItem::event(StreamEvent::done());
                    return;
                }
            };

            let outcome = tokio::select! {
                _ = turn.abort.cancelled() => return,
                outcome = agent.execute(&provider, &plan.sub_queries) => outcome,
            };

            let failures = outcome.results.iter().filter(|r| r.error.is_some()).count();
            yield AgentItem::event(StreamEvent::data(format!(
                "Retrieved {} document(s) across {} sub-queries ({} failed).\n",
                outcome.total_documents,
                outcome.results.len(),
                failures,
            )));

            let target = if outcome.total_documents > 0 {
                "ranker"
            } else {
                "writer"
            };
            yield AgentItem::Handoff(Handoff {
                target: target.to_string(),
                reason: format!("{} documents retrieved", outcome.total_documents),
                payload: HandoffPayload {
                    plan: Some(plan),
                    search: Some(outcome),
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
    use crate::agentstream::agents::planner::{QueryIntent, SearchStrategy};
    use crate::agentstream::search::MockSearchProvider;

    fn sub(id: &str, query: &str) -> SubQuery {
        SubQuery {
            id: id.to_string(),
            query: query.to_string(),
            intent: QueryIntent::Factual,
            priority: 1,
            search_strategy: SearchStrategy::Semantic,
        }
    }

    #[tokio::test]
    async fn aggregates_union_of_document_ids() {
        let agent = ParallelSearchAgent::new(Some(Arc::new(MockSearchProvider)), 10.0);
        let provider: Arc<dyn SearchProvider> = Arc::new(MockSearchProvider);
        // Identical queries return identical ids; the union must count
        // them once.
        let outcome = agent
            .execute(&provider, &[sub("sq-1", "same query"), sub("sq-2", "same query")])
            .await;
        assert_eq!(outcome.total_documents, 5);
        assert_eq!(outcome.results[0].documents.len(), 5);
        assert!(outcome.results[1].documents.is_empty());
        // Relevance is computed before deduplication.
        assert!(outcome.results[1].relevance > 0.0);
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_siblings() {
        let agent = ParallelSearchAgent::new(Some(Arc::new(MockSearchProvider)), 10.0);
        let provider: Arc<dyn SearchProvider> = Arc::new(MockSearchProvider);
        let outcome = agent
            .execute(
                &provider,
                &[sub("sq-1", "searchfail please"), sub("sq-2", "rust streams")],
            )
            .await;
        assert!(outcome.results[0].error.is_some());
        assert!(outcome.results[1].error.is_none());
        assert_eq!(outcome.best_sub_query_id.as_deref(), Some("sq-2"));
        assert_eq!(outcome.total_documents, 5);
    }

    #[tokio::test]
    async fn relevance_is_clamped() {
        // Scale of 1.0 pushes avg scores above 1; clamp holds the bound.
        let agent = ParallelSearchAgent::new(Some(Arc::new(MockSearchProvider)), 1.0);
        let provider: Arc<dyn SearchProvider> = Arc::new(MockSearchProvider);
        let outcome = agent.execute(&provider, &[sub("sq-1", "rust")]).await;
        assert!((outcome.results[0].relevance - 1.0).abs() < f64::EPSILON);
    }
}
