//! Final-answer writer.
//!
//! Last phase of the multi-agent flow: folds the plan, the ranker's
//! synthesized context, and up to five citations into a system prompt, and
//! streams the reply. Runs standalone too — without a baton it behaves
//! like a plain turn with a writing-focused prompt.

use std::sync::Arc;

use crate::agentstream::agents::{next_token, Agent, AgentItem, AgentStream, TurnConfig};
use crate::agentstream::conversation::{prepare_for_llm, PrepareConfig};
use crate::agentstream::event::{AgentContext, ContentType, ErrorCode, StreamEvent};
use crate::agentstream::llm::{CompletionOptions, LlmClient, TokenChunk};

/// Citations included in the writing prompt.
const MAX_CITATIONS: usize = 5;

pub struct WriterAgent {
    client: Arc<dyn LlmClient>,
}

impl WriterAgent {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn system_prompt(turn: &TurnConfig) -> String {
        let mut prompt = String::from(
            "You are the answer writer for a multi-agent assistant. Compose a clear, \
             complete reply to the user's question.",
        );

        if let Some(plan) = &turn.baton.plan {
            prompt.push_str(&format!(
                "\n\nThe question was analyzed as: {}",
                plan.reasoning
            ));
        }

        if let Some(findings) = &turn.baton.findings {
            if !findings.context.is_empty() {
                prompt.push_str(&format!(
                    "\n\nGround your answer in these findings (confidence {:.2}):\n{}",
                    findings.confidence, findings.context
                ));
            }
        }

        if let Some(search) = &turn.baton.search {
            let titles: Vec<String> = search
                .results
                .iter()
                .flat_map(|r| r.documents.iter())
                .take(MAX_CITATIONS)
                .map(|d| d.title.clone())
                .collect();
            if !titles.is_empty() {
                prompt.push_str("\n\nCite from: ");
                prompt.push_str(&titles.join("; "));
            }
        }
        prompt
    }
}

impl Agent for WriterAgent {
    fn name(&self) -> &str {
        "WriterAgent"
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let client = self.client.clone();
        let name = self.name().to_string();

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));
            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::FinalAnswer,
                Some("writing".to_string()),
            ));

            let messages = prepare_for_llm(&ctx.message_history, &PrepareConfig::default());
            let mut options = CompletionOptions::streaming();
            options.max_tokens = turn.max_tokens;
            options.temperature = turn.temperature;
            options.system_prompt = Some(match &turn.system_prompt {
                Some(prompt) => prompt.clone(),
                None => Self::system_prompt(&turn),
            });

            let mut tokens = match client.stream(&messages, &options).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("WriterAgent: provider refused stream: {}", e);
                    }
                    yield AgentItem::event(StreamEvent::error(e.code, e.message));
                    return;
                }
            };

            loop {
                match next_token(&mut tokens, &turn.abort).await {
                    Some(TokenChunk::Content(chunk)) => {
                        yield AgentItem::event(StreamEvent::data(chunk));
                    }
                    Some(TokenChunk::Error(e)) => {
                        yield AgentItem::event(StreamEvent::error(
                            if e.code == ErrorCode::Timeout {
                                ErrorCode::Timeout
                            } else {
                                ErrorCode::AgentError
                            },
                            e.message,
                        ));
                        return;
                    }
                    Some(TokenChunk::Done) | None => break,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentstream::agents::planner::ExecutionPlan;
    use crate::agentstream::agents::ranker::RankedFindings;
    use crate::agentstream::agents::HandoffPayload;

    #[test]
    fn prompt_folds_in_plan_and_findings() {
        let mut turn = TurnConfig::default();
        turn.baton = HandoffPayload {
            plan: Some(ExecutionPlan::fallback("what is rust?")),
            search: None,
            findings: Some(RankedFindings {
                selected: vec![],
                context: "## sq-1 — what is rust?\n### Rust Book\nA language.".to_string(),
                confidence: 0.85,
            }),
        };
        let prompt = WriterAgent::system_prompt(&turn);
        assert!(prompt.contains("fallback plan"));
        assert!(prompt.contains("Rust Book"));
        assert!(prompt.contains("0.85"));
    }

    #[test]
    fn standalone_prompt_is_plain() {
        let prompt = WriterAgent::system_prompt(&TurnConfig::default());
        assert!(prompt.contains("answer writer"));
        assert!(!prompt.contains("findings"));
    }
}
