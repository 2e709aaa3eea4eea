//! Event-ordering contract for individual agents: metadata strictly
//! first, data in emission order, exactly one terminal event.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;

use agentstream::agents::plain::PlainAgent;
use agentstream::agents::rag::RagAgent;
use agentstream::agents::{Agent, AgentItem, TurnConfig};
use agentstream::event::{AgentContext, ChatMessage, ChatRole, ErrorCode, StreamEvent};
use agentstream::llm::mock::MockLlmClient;
use agentstream::llm::{CompletionOptions, LlmClient, LlmError, TokenStream};
use agentstream::search::MockSearchProvider;

struct FailingClient;

#[async_trait]
impl LlmClient for FailingClient {
    fn provider_name(&self) -> &str {
        "failing"
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<TokenStream, LlmError> {
        Err(LlmError::upstream("provider unreachable"))
    }

    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        Err(LlmError::upstream("provider unreachable"))
    }
}

fn context(content: &str) -> AgentContext {
    AgentContext::new(
        "u1",
        "t1",
        vec![ChatMessage::new("m1", ChatRole::User, content)],
    )
}

async fn run_to_events(agent: &dyn Agent, ctx: AgentContext) -> Vec<StreamEvent> {
    let items: Vec<AgentItem> = agent.run(ctx, TurnConfig::default()).collect().await;
    items
        .into_iter()
        .filter_map(|item| match item {
            AgentItem::Event(event) => Some(event),
            AgentItem::Handoff(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn plain_agent_emits_metadata_first_and_done_last() {
    agentstream::init_logger();
    let agent = PlainAgent::new(Arc::new(MockLlmClient::new(0)));
    let events = run_to_events(&agent, context("2+2?")).await;

    assert!(matches!(events.first(), Some(StreamEvent::Metadata { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    let data_count = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Data { .. }))
        .count();
    assert!(data_count >= 1);

    // Exactly one terminal event, and nothing after it.
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1);
}

#[tokio::test]
async fn plain_agent_reports_agent_updated_with_final_answer() {
    let agent = PlainAgent::new(Arc::new(MockLlmClient::new(0)));
    let events = run_to_events(&agent, context("hello")).await;

    let updated = events.iter().find_map(|e| match e {
        StreamEvent::AgentUpdated {
            agent_name,
            content_type,
            ..
        } => Some((agent_name.clone(), *content_type)),
        _ => None,
    });
    let (name, content_type) = updated.expect("agent_updated missing");
    assert_eq!(name, "PlainAgent");
    assert_eq!(content_type, agentstream::event::ContentType::FinalAnswer);
}

#[tokio::test]
async fn failing_provider_ends_with_error_and_no_done() {
    let agent = PlainAgent::new(Arc::new(FailingClient));
    let events = run_to_events(&agent, context("hello")).await;

    assert!(matches!(events.first(), Some(StreamEvent::Metadata { .. })));
    match events.last() {
        Some(StreamEvent::Error { code, .. }) => {
            assert_eq!(*code, ErrorCode::UpstreamError);
        }
        other => panic!("expected terminal error, got {:?}", other),
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::Done { .. })));
}

#[tokio::test]
async fn aborted_turn_stops_emitting_without_terminal_event() {
    let agent = PlainAgent::new(Arc::new(MockLlmClient::new(20)));
    let turn = TurnConfig::default();
    let abort = turn.abort.clone();

    let mut stream = agent.run(context("a somewhat longer question to stream"), turn);

    // Let a couple of events through, then abort.
    let mut before_abort = 0;
    while let Some(item) = stream.next().await {
        if let AgentItem::Event(event) = item {
            if event.is_terminal() {
                panic!("terminal event before abort");
            }
            before_abort += 1;
            if before_abort == 3 {
                abort.cancel();
                break;
            }
        }
    }

    // Whatever remains must drain quickly and contain no terminal event.
    let rest: Vec<AgentItem> = stream.collect().await;
    assert!(rest.len() <= 1);
    for item in rest {
        if let AgentItem::Event(event) = item {
            assert!(!event.is_terminal());
        }
    }
}

#[tokio::test]
async fn rag_agent_emits_citations_metadata_and_thought_channel() {
    let agent = RagAgent::new(
        Arc::new(MockLlmClient::new(0)),
        Some(Arc::new(MockSearchProvider)),
    );
    let events = run_to_events(&agent, context("what is a stream?")).await;

    // Two metadata events: the opener and the citation-bearing one.
    let metadata_events: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Metadata { .. }))
        .collect();
    assert_eq!(metadata_events.len(), 2);
    if let StreamEvent::Metadata { citations, .. } = metadata_events[1] {
        assert!(!citations.is_empty());
    }

    // thoughts first, then final_answer.
    let channels: Vec<agentstream::event::ContentType> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::AgentUpdated { content_type, .. } => Some(*content_type),
            _ => None,
        })
        .collect();
    assert_eq!(
        channels,
        vec![
            agentstream::event::ContentType::Thoughts,
            agentstream::event::ContentType::FinalAnswer,
        ]
    );
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn rag_agent_without_search_backend_degrades_gracefully() {
    let agent = RagAgent::new(Arc::new(MockLlmClient::new(0)), None);
    let events = run_to_events(&agent, context("anything")).await;

    let notes: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Data { chunk } => Some(chunk.clone()),
            _ => None,
        })
        .collect();
    assert!(notes.contains("No search backend configured"));
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}
