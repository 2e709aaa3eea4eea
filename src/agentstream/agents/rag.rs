//! Retrieval-grounded agent.
//!
//! Searches the external collaborator for documents matching the latest
//! user message, reports the hit count on the thoughts channel, re-emits
//! metadata with the accumulated citations, and then streams a reply
//! generated against a context prompt that includes the retrieved
//! documents. When no search collaborator is configured the agent proceeds
//! ungrounded and says so in the thoughts channel.
//!
//! The researcher variant is the same producer configured for deeper
//! retrieval ([`RagAgent::researcher`]).

use std::sync::Arc;

use crate::agentstream::agents::{next_token, Agent, AgentItem, AgentStream, TurnConfig};
use crate::agentstream::conversation::{prepare_for_llm, PrepareConfig};
use crate::agentstream::event::{AgentContext, ContentType, ErrorCode, StreamEvent};
use crate::agentstream::llm::{CompletionOptions, LlmClient, TokenChunk};
use crate::agentstream::search::{Document, SearchOptions, SearchProvider};

/// Default number of documents retrieved per turn.
const DEFAULT_TOP_K: usize = 5;
/// The researcher variant digs deeper.
const RESEARCHER_TOP_K: usize = 8;

pub struct RagAgent {
    client: Arc<dyn LlmClient>,
    search: Option<Arc<dyn SearchProvider>>,
    display_name: String,
    top_k: usize,
}

impl RagAgent {
    pub fn new(client: Arc<dyn LlmClient>, search: Option<Arc<dyn SearchProvider>>) -> Self {
        Self {
            client,
            search,
            display_name: "RAGAgent".to_string(),
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Deep-retrieval variant registered under `researcher`.
    pub fn researcher(client: Arc<dyn LlmClient>, search: Option<Arc<dyn SearchProvider>>) -> Self {
        Self {
            display_name: "ResearcherAgent".to_string(),
            top_k: RESEARCHER_TOP_K,
            ..Self::new(client, search)
        }
    }

    /// Override the per-turn retrieval depth.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    fn context_prompt(documents: &[Document]) -> String {
        let mut prompt = String::from(
            "You are a helpful assistant. Ground your answer in the retrieved documents \
             below and cite them when relevant. If they do not cover the question, say so.\n",
        );
        for (idx, doc) in documents.iter().enumerate() {
            prompt.push_str(&format!(
                "\n[{}] {}\n{}\n",
                idx + 1,
                doc.title,
                doc.content
            ));
        }
        prompt
    }
}

impl Agent for RagAgent {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn run(&self, ctx: AgentContext, turn: TurnConfig) -> AgentStream {
        let client = self.client.clone();
        let search = self.search.clone();
        let name = self.display_name.clone();
        let top_k = self.top_k;

        let stream = async_stream::stream! {
            yield AgentItem::event(StreamEvent::metadata(ctx.trace_id));
            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::Thoughts,
                Some("searching".to_string()),
            ));

            let query = ctx.latest_user_message().to_string();
            let mut documents: Vec<Document> = Vec::new();

            match &search {
                Some(provider) => {
                    match provider
                        .search(&query, &SearchOptions::with_top_k(top_k))
                        .await
                    {
                        Ok(docs) => {
                            documents = docs;
                            yield AgentItem::event(StreamEvent::data(format!(
                                "Found {} relevant document(s).\n",
                                documents.len()
                            )));
                        }
                        Err(e) => {
                            // Retrieval failure degrades to an ungrounded
                            // reply rather than failing the turn.
                            if log::log_enabled!(log::Level::Warn) {
                                log::warn!("{}: retrieval failed: {}", name, e);
                            }
                            yield AgentItem::event(StreamEvent::data(format!(
                                "Search unavailable ({}); answering without retrieval.\n",
                                e
                            )));
                        }
                    }
                    if turn.abort.is_cancelled() {
                        return;
                    }
                }
                None => {
                    yield AgentItem::event(StreamEvent::data(
                        "No search backend configured; answering without retrieval.\n",
                    ));
                }
            }

            let citations = documents.iter().map(|d| d.to_citation()).collect();
            yield AgentItem::event(StreamEvent::metadata_with_citations(ctx.trace_id, citations));
            yield AgentItem::event(StreamEvent::agent_updated(
                &name,
                ContentType::FinalAnswer,
                Some("generating".to_string()),
            ));

            let messages = prepare_for_llm(&ctx.message_history, &PrepareConfig::default());
            let mut options = CompletionOptions::streaming();
            options.max_tokens = turn.max_tokens;
            options.temperature = turn.temperature;
            options.system_prompt = Some(match &turn.system_prompt {
                Some(prompt) => prompt.clone(),
                None => Self::context_prompt(&documents),
            });

            let mut tokens = match client.stream(&messages, &options).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("{}: provider refused stream: {}", name, e);
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
