//! Plain single-model agent.
//!
//! The simplest producer: prepare the history, open a token stream from
//! the provider, forward tokens as `data` events. Provider failures become
//! a terminal `error{AGENT_ERROR}`; an abort ends the sequence with no
//! further events.

use std::sync::Arc;

use crate::agentstream::agents::{next_token, Agent, AgentItem, AgentStream, TurnConfig};
use crate::agentstream::conversation::{prepare_for_llm, PrepareConfig};
use crate::agentstream::event::{AgentContext, ContentType, ErrorCode, StreamEvent};
use crate::agentstream::llm::{CompletionOptions, LlmClient, TokenChunk};

/// Default system prompt when the request carries none.
const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer directly and concisely.";

pub struct PlainAgent {
    client: Arc<dyn LlmClient>,
}

impl PlainAgent {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl Agent for PlainAgent {
    fn name(&self) -> &str {
        "PlainAgent"
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let client = self.client.clone();
        let name = self.name().to_string();

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));
            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::FinalAnswer,
                None,
            ));

            let messages = prepare_for_llm(&ctx.message_history, &PrepareConfig::default());
            let mut options = CompletionOptions::streaming();
            options.max_tokens = turn.max_tokens;
            options.temperature = turn.temperature;
            options.system_prompt = Some(
                turn.system_prompt
                    .clone()
                    .unwrap_or_else(|| SYSTEM_PROMPT.to_string()),
            );

            let mut tokens = match client.stream(&messages, &options).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("PlainAgent: provider refused stream: {}", e);
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
                // Stopped mid-stream: end without a terminal event.
                return;
            }
            yield AgentItem::event(StreamEvent::done());
        };
        Box::pin(stream)
    }
}
