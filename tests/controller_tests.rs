//! End-to-end tests over a real listener: the streaming turn, ownership
//! checks, etag conflicts, stop, and pagination behave per the HTTP
//! contract.

use std::sync::Arc;
use std::time::Duration;

use agentstream::abort::StreamAbortFabric;
use agentstream::agents::parallel_search::ParallelSearchAgent;
use agentstream::agents::plain::PlainAgent;
use agentstream::agents::planner::PlannerAgent;
use agentstream::agents::rag::RagAgent;
use agentstream::agents::ranker::ResultRankerAgent;
use agentstream::agents::writer::WriterAgent;
use agentstream::controller::{router, AppState};
use agentstream::llm::mock::MockLlmClient;
use agentstream::orchestrator::Orchestrator;
use agentstream::registry::AgentRegistry;
use agentstream::repository::memory::MemoryRepository;
use agentstream::search::{MockSearchProvider, SearchProvider};

fn mock_state(delay_ms: u64) -> AppState {
    let llm = Arc::new(MockLlmClient::new(delay_ms));
    let search: Option<Arc<dyn SearchProvider>> = Some(Arc::new(MockSearchProvider));

    let registry = Arc::new(AgentRegistry::new());
    registry.register("normal", Arc::new(PlainAgent::new(llm.clone())));
    registry.register("rag", Arc::new(RagAgent::new(llm.clone(), search.clone())));
    registry.register(
        "researcher",
        Arc::new(RagAgent::researcher(llm.clone(), search.clone())),
    );
    registry.register("planner", Arc::new(PlannerAgent::new(llm.clone())));
    registry.register(
        "parallel-search",
        Arc::new(ParallelSearchAgent::new(search, 10.0)),
    );
    registry.register("ranker", Arc::new(ResultRankerAgent::new(Some(llm.clone()))));
    registry.register("writer", Arc::new(WriterAgent::new(llm)));
    registry.register("multi-agent", Arc::new(Orchestrator::new(registry.clone())));

    AppState::new(
        registry,
        Arc::new(MemoryRepository::new()),
        Arc::new(StreamAbortFabric::local_only()),
    )
}

/// Serve the app on an ephemeral port; returns the API base URL.
async fn spawn_app(state: AppState) -> String {
    let app = axum::Router::new().nest("/api/v1", router(state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{}/api/v1", addr)
}

/// Parse an SSE body into (event kind, payload) pairs, skipping comments.
fn parse_frames(body: &str) -> Vec<(String, serde_json::Value)> {
    let mut frames = Vec::new();
    for block in body.split("\n\n") {
        let mut kind: Option<&str> = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                kind = Some(rest);
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data.push_str(rest);
            }
        }
        if let Some(kind) = kind {
            let payload = serde_json::from_str(&data).unwrap_or(serde_json::Value::Null);
            frames.push((kind.to_string(), payload));
        }
    }
    frames
}

fn stream_body(thread: &str, user: &str, agent: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "thread_id": thread,
        "user_id": user,
        "agent_type": agent,
        "messages": [{ "id": "m1", "role": "user", "content": content }],
    })
}

#[tokio::test]
async fn plain_turn_streams_and_persists() {
    agentstream::init_logger();
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body("T1", "U1", "normal", "2+2?"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let frames = parse_frames(&body);

    assert_eq!(frames.first().map(|(k, _)| k.as_str()), Some("metadata"));
    assert!(frames[0].1.get("trace_id").is_some());
    let data_chunks: String = frames
        .iter()
        .filter(|(k, _)| k == "data")
        .filter_map(|(_, p)| p.get("chunk").and_then(|c| c.as_str()))
        .collect();
    assert!(!data_chunks.is_empty());
    assert_eq!(frames.last().map(|(k, _)| k.as_str()), Some("done"));

    // Persistence settles after the stream body completes.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let thread: serde_json::Value = client
        .get(format!("{}/chat/threads/T1", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(thread["user_id"], "U1");

    let messages: serde_json::Value = client
        .get(format!("{}/chat/threads/T1/messages", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = messages["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["role"], "user");
    assert_eq!(items[0]["content"], "2+2?");
    // The persisted assistant reply equals the concatenated data chunks.
    assert_eq!(items[1]["role"], "assistant");
    assert_eq!(items[1]["content"], data_chunks);
}

#[tokio::test]
async fn ownership_mismatch_returns_403_without_content() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body("T1", "U1", "normal", "mine"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = client
        .get(format!("{}/chat/threads/T1", base))
        .header("X-User-Id", "U2")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body.get("user_id").is_none());
    assert!(body.get("error").is_some());
}

#[tokio::test]
async fn stale_if_match_yields_409() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body("T1", "U1", "normal", "seed"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let thread: serde_json::Value = client
        .get(format!("{}/chat/threads/T1", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let etag = thread["etag"].as_str().unwrap().to_string();

    let first = client
        .patch(format!("{}/chat/threads/T1", base))
        .header("X-User-Id", "U1")
        .header("If-Match", &etag)
        .json(&serde_json::json!({ "title": "renamed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = client
        .patch(format!("{}/chat/threads/T1", base))
        .header("X-User-Id", "U1")
        .header("If-Match", &etag)
        .json(&serde_json::json!({ "title": "too late" }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
}

#[tokio::test]
async fn multi_agent_turn_walks_the_pipeline() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    let body = client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body(
            "T5",
            "U1",
            "multi-agent",
            "compare rust vs go for services",
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_frames(&body);

    let agent_sequence: Vec<String> = frames
        .iter()
        .filter(|(k, _)| k == "agent_updated")
        .filter_map(|(_, p)| p.get("agent_name").and_then(|n| n.as_str()))
        .map(|s| s.to_string())
        .collect();
    assert_eq!(
        agent_sequence,
        vec![
            "PlannerAgent",
            "ParallelSearchAgent",
            "ResultRankerAgent",
            "WriterAgent",
        ]
    );
    assert_eq!(frames.last().map(|(k, _)| k.as_str()), Some("done"));
}

#[tokio::test]
async fn unknown_agent_type_is_rejected_before_streaming() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body("T1", "U1", "no-such-agent", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn stop_mid_stream_ceases_data_promptly() {
    let base = spawn_app(mock_state(40)).await;
    let client = reqwest::Client::new();

    let mut response = client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body(
            "T2",
            "U1",
            "normal",
            "please stream a reasonably long answer for this stop test",
        ))
        .send()
        .await
        .unwrap();

    // Wait until the stream is demonstrably flowing.
    let mut buffer = String::new();
    while let Some(chunk) = response.chunk().await.unwrap() {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        if buffer.contains("event: data") {
            break;
        }
    }

    let stop: serde_json::Value = client
        .post(format!("{}/chat/stop", base))
        .json(&serde_json::json!({ "thread_id": "T2" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stop["success"], true);

    // The producer observes the token within one iteration; the stream
    // must wind down far faster than the full reply would take.
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while let Ok(Some(chunk)) = response.chunk().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await;
    assert!(drained.is_ok(), "stream did not terminate after stop");
}

#[tokio::test]
async fn agents_and_status_endpoints() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    let agents: serde_json::Value = client
        .get(format!("{}/chat/agents", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = agents["agents"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(names.contains(&"normal"));
    assert!(names.contains(&"multi-agent"));

    let status: serde_json::Value = client
        .get(format!("{}/chat/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["active_streams"], 0);
    assert_eq!(status["redis_enabled"], false);
    assert_eq!(status["persistence_enabled"], true);
}

#[tokio::test]
async fn thread_listing_requires_user_and_pages() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/chat/threads", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    for i in 0..25 {
        client
            .post(format!("{}/chat/stream", base))
            .json(&stream_body(&format!("T{:02}", i), "U3", "normal", "seed"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let page: serde_json::Value = client
        .get(format!("{}/chat/threads?user_id=U3&limit=20", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 20);
    assert_eq!(page["has_more"], true);
    let token = page["continuation_token"].as_str().unwrap();

    let rest: serde_json::Value = client
        .get(format!(
            "{}/chat/threads?user_id=U3&limit=20&continuation_token={}",
            base, token
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rest["items"].as_array().unwrap().len(), 5);
    assert_eq!(rest["has_more"], false);
}

#[tokio::test]
async fn soft_delete_restore_and_bookmark_round_trip() {
    let base = spawn_app(mock_state(0)).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/chat/stream", base))
        .json(&stream_body("T9", "U1", "normal", "seed"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bookmark: serde_json::Value = client
        .post(format!("{}/chat/threads/T9/bookmark", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bookmark["is_bookmarked"], true);

    let delete = client
        .delete(format!("{}/chat/threads/T9", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status(), 200);

    // Hidden from default reads once soft-deleted.
    let missing = client
        .get(format!("{}/chat/threads/T9", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let restore = client
        .post(format!("{}/chat/threads/T9/restore", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap();
    assert_eq!(restore.status(), 200);

    let back = client
        .get(format!("{}/chat/threads/T9", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap();
    assert_eq!(back.status(), 200);

    let permanent = client
        .delete(format!("{}/chat/threads/T9/permanent", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap();
    assert_eq!(permanent.status(), 200);

    let gone = client
        .get(format!("{}/chat/threads/T9", base))
        .header("X-User-Id", "U1")
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}
