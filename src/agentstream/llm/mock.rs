//! Deterministic in-process token source.
//!
//! The mock produces content-dependent replies with no network I/O, which
//! keeps the orchestrator and controller tests hermetic. Two prompt cues
//! flip it into structured mode:
//!
//! - a planning prompt (the planner agent's system prompt mentions
//!   "query planner") yields a JSON execution plan whose shape depends on
//!   the user query — `compare`/`vs` queries become parallel multi-query
//!   plans, `research` queries request research, everything else is a
//!   single-query plan;
//! - a ranking prompt (mentions "result ranker") yields a JSON ranking
//!   over the `sq-*` ids found in the prompt.
//!
//! Everything else gets a deterministic prose reply streamed word by word
//! with the configured per-token delay.

use async_trait::async_trait;
use std::time::Duration;

use crate::agentstream::event::{ChatMessage, ChatRole};
use crate::agentstream::llm::{CompletionOptions, LlmClient, LlmError, TokenChunk, TokenStream};

/// Prompt fragment that flips the mock into plan mode.
const PLANNER_CUE: &str = "query planner";
/// Prompt fragment that flips the mock into ranking mode.
const RANKER_CUE: &str = "result ranker";

/// Deterministic mock token source.
pub struct MockLlmClient {
    token_delay: Duration,
}

impl MockLlmClient {
    /// `delay_ms` is the pause between streamed tokens; zero streams
    /// without pausing.
    pub fn new(delay_ms: u64) -> Self {
        Self {
            token_delay: Duration::from_millis(delay_ms),
        }
    }

    /// Full prompt text the cue detection runs over.
    fn prompt_text(messages: &[ChatMessage], options: &CompletionOptions) -> String {
        let mut text = options.system_prompt.clone().unwrap_or_default();
        for msg in messages {
            text.push('\n');
            text.push_str(&msg.content);
        }
        text.to_ascii_lowercase()
    }

    fn latest_user_content(messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Render the full deterministic reply for the given input.
    fn render(&self, messages: &[ChatMessage], options: &CompletionOptions) -> String {
        let prompt = Self::prompt_text(messages, options);
        let query = Self::latest_user_content(messages);

        if prompt.contains(PLANNER_CUE) {
            return mock_plan(&query);
        }
        if prompt.contains(RANKER_CUE) {
            return mock_ranking(&prompt);
        }
        if options.json_mode {
            return serde_json::json!({ "answer": deterministic_reply(&query) }).to_string();
        }
        deterministic_reply(&query)
    }
}

/// Prose reply used outside the structured modes.
fn deterministic_reply(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return "I received an empty message.".to_string();
    }
    format!(
        "Considering \"{}\": this is a deterministic reply produced by the mock provider.",
        trimmed
    )
}

/// Content-dependent execution plan, as a JSON string.
fn mock_plan(query: &str) -> String {
    let lowered = query.to_ascii_lowercase();
    let comparative = lowered.contains("compare") || lowered.contains(" vs ");
    let research = lowered.contains("research");

    let plan = if comparative {
        serde_json::json!({
            "original_query": query,
            "query_type": "complex",
            "sub_queries": [
                {
                    "id": "sq-1",
                    "query": format!("{} (first aspect)", query),
                    "intent": "comparative",
                    "priority": 1,
                    "search_strategy": "hybrid"
                },
                {
                    "id": "sq-2",
                    "query": format!("{} (second aspect)", query),
                    "intent": "comparative",
                    "priority": 2,
                    "search_strategy": "semantic"
                }
            ],
            "requires_research": false,
            "requires_rag": true,
            "parallel_execution": true,
            "reasoning": "comparative query split into one sub-query per side"
        })
    } else if research {
        serde_json::json!({
            "original_query": query,
            "query_type": "multi-part",
            "sub_queries": [
                {
                    "id": "sq-1",
                    "query": format!("{} (background)", query),
                    "intent": "exploratory",
                    "priority": 1,
                    "search_strategy": "semantic"
                },
                {
                    "id": "sq-2",
                    "query": format!("{} (current state)", query),
                    "intent": "factual",
                    "priority": 2,
                    "search_strategy": "keyword"
                },
                {
                    "id": "sq-3",
                    "query": format!("{} (open questions)", query),
                    "intent": "exploratory",
                    "priority": 3,
                    "search_strategy": "hybrid"
                }
            ],
            "requires_research": true,
            "requires_rag": true,
            "parallel_execution": true,
            "reasoning": "research query fanned out across three angles"
        })
    } else {
        serde_json::json!({
            "original_query": query,
            "query_type": "simple",
            "sub_queries": [
                {
                    "id": "sq-1",
                    "query": query,
                    "intent": "factual",
                    "priority": 1,
                    "search_strategy": "semantic"
                }
            ],
            "requires_research": false,
            "requires_rag": false,
            "parallel_execution": false,
            "reasoning": "single direct question"
        })
    };
    plan.to_string()
}

/// Ranking over the `sq-*` ids present in the prompt, as a JSON string.
fn mock_ranking(prompt: &str) -> String {
    let mut ids: Vec<String> = Vec::new();
    for token in prompt.split(|c: char| !(c.is_alphanumeric() || c == '-')) {
        if token.starts_with("sq-") && token.len() > 3 && !ids.iter().any(|i| i == token) {
            ids.push(token.to_string());
        }
    }
    let rankings: Vec<serde_json::Value> = ids
        .iter()
        .enumerate()
        .map(|(idx, id)| {
            // First id scores highest, descending deterministically.
            let score = (0.9 - 0.15 * idx as f64).max(0.1);
            serde_json::json!({ "id": id, "score": score })
        })
        .collect();
    serde_json::json!({
        "rankings": rankings,
        "reasoning": "deterministic mock ranking in prompt order"
    })
    .to_string()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream, LlmError> {
        let reply = self.render(messages, options);
        let delay = self.token_delay;
        // Word-sized tokens keep the stream observable in tests.
        let tokens: Vec<String> = reply
            .split_inclusive(' ')
            .map(|t| t.to_string())
            .collect();

        let stream = async_stream::stream! {
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield TokenChunk::Content(token);
            }
            yield TokenChunk::Done;
        };
        Ok(Box::pin(stream))
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        Ok(self.render(messages, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new("m1", ChatRole::User, content)]
    }

    #[tokio::test]
    async fn comparative_query_yields_parallel_plan() {
        let client = MockLlmClient::new(0);
        let mut options = CompletionOptions::planner();
        options.system_prompt = Some("You are a query planner.".to_string());

        let raw = client
            .complete(&user("compare rust vs go for services"), &options)
            .await
            .unwrap();
        let plan: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(plan["query_type"], "complex");
        assert_eq!(plan["parallel_execution"], true);
        assert_eq!(plan["sub_queries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn plain_query_yields_simple_plan() {
        let client = MockLlmClient::new(0);
        let mut options = CompletionOptions::planner();
        options.system_prompt = Some("You are a query planner.".to_string());

        let raw = client.complete(&user("2+2?"), &options).await.unwrap();
        let plan: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(plan["query_type"], "simple");
        assert_eq!(plan["parallel_execution"], false);
    }

    #[tokio::test]
    async fn ranking_mode_scores_ids_in_prompt_order() {
        let client = MockLlmClient::new(0);
        let mut options = CompletionOptions::ranker();
        options.system_prompt =
            Some("You are a result ranker. Candidates: sq-1 sq-2".to_string());

        let raw = client.complete(&user("rank these"), &options).await.unwrap();
        let ranking: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let rankings = ranking["rankings"].as_array().unwrap();
        assert_eq!(rankings.len(), 2);
        assert!(rankings[0]["score"].as_f64() > rankings[1]["score"].as_f64());
    }

    #[tokio::test]
    async fn stream_ends_with_done() {
        use futures_util::StreamExt;

        let client = MockLlmClient::new(0);
        let mut stream = client
            .stream(&user("hello"), &CompletionOptions::streaming())
            .await
            .unwrap();
        let mut saw_content = false;
        let mut last_was_done = false;
        while let Some(chunk) = stream.next().await {
            last_was_done = matches!(chunk, TokenChunk::Done);
            if matches!(chunk, TokenChunk::Content(_)) {
                saw_content = true;
            }
        }
        assert!(saw_content);
        assert!(last_was_done);
    }
}
