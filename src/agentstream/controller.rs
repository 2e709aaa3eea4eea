//! HTTP surface: bind the streaming pipeline, registry, abort fabric, and
//! repository to axum routes.
//!
//! The controller translates HTTP into core operations and enforces
//! ownership: every operation referencing an existing thread verifies the
//! requesting user owns it (403 on mismatch, 404 when missing, 409 on
//! etag conflict). Pre-stream failures return JSON error bodies; once the
//! stream is open, failures ride the stream as `error` frames.
//!
//! After a stream completes the controller persists the turn — the user
//! message and the accumulated assistant reply — and swallows persistence
//! failures with a log line: the client already has its answer. Partial
//! content accumulated before a stream error is persisted as-is.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::agentstream::abort::{RedisAbortTransport, StreamAbortFabric};
use crate::agentstream::agents::plain::PlainAgent;
use crate::agentstream::agents::planner::PlannerAgent;
use crate::agentstream::agents::rag::RagAgent;
use crate::agentstream::agents::ranker::ResultRankerAgent;
use crate::agentstream::agents::writer::WriterAgent;
use crate::agentstream::agents::parallel_search::ParallelSearchAgent;
use crate::agentstream::agents::{AgentItem, TurnConfig};
use crate::agentstream::config::{AppConfig, DatabaseProvider, LlmProvider};
use crate::agentstream::conversation::deduplicate_by_id;
use crate::agentstream::event::{AgentContext, ChatMessage, ChatRole, StreamEvent};
use crate::agentstream::llm::build_client;
use crate::agentstream::orchestrator::Orchestrator;
use crate::agentstream::registry::AgentRegistry;
use crate::agentstream::repository::{
    cosmos::CosmosRepository, memory::MemoryRepository, sqlite::SqliteRepository, ChatRepository,
    ListMessagesOptions, ListThreadsOptions, NewMessage, NewThread, Thread, ThreadUpdate,
    UpdateOutcome, WriteOptions,
};
use crate::agentstream::search::{MockSearchProvider, SearchProvider};
use crate::agentstream::sse::{stream_headers, to_sse_event};

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub repository: Arc<dyn ChatRepository>,
    pub abort: Arc<StreamAbortFabric>,
}

impl AppState {
    /// Wire the full stack from configuration: the LLM client, the agent
    /// set, the repository backend, and the abort fabric.
    pub async fn from_config(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let llm = build_client(&config.llm);

        // The search collaborator is external; the mock deployment wires
        // the deterministic stub so retrieval flows stay exercisable.
        let search: Option<Arc<dyn SearchProvider>> =
            if config.llm.effective_provider() == LlmProvider::Mock {
                Some(Arc::new(MockSearchProvider))
            } else {
                None
            };

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
            Arc::new(ParallelSearchAgent::new(
                search.clone(),
                config.search.relevance_scale,
            )),
        );
        registry.register("ranker", Arc::new(ResultRankerAgent::new(Some(llm.clone()))));
        registry.register("writer", Arc::new(WriterAgent::new(llm.clone())));
        registry.register("multi-agent", Arc::new(Orchestrator::new(registry.clone())));

        let repository: Arc<dyn ChatRepository> = match config.database.provider {
            DatabaseProvider::Memory => Arc::new(MemoryRepository::new()),
            DatabaseProvider::Sqlite => {
                Arc::new(SqliteRepository::open(&config.database.sqlite_path)?)
            }
            DatabaseProvider::CosmosDb => Arc::new(CosmosRepository::new(
                &config.database.cosmos_endpoint,
                &config.database.cosmos_key,
                &config.database.cosmos_database,
                &config.database.cosmos_container,
            )?),
        };

        let transport = match &config.abort.redis_url {
            Some(url) => match RedisAbortTransport::connect(url).await {
                Ok(transport) => Some(transport),
                Err(e) => {
                    log::warn!(
                        "AppState::from_config: redis unavailable ({}), abort is local-only",
                        e
                    );
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            registry,
            repository,
            abort: Arc::new(StreamAbortFabric::new(transport)),
        })
    }

    /// Test-friendly constructor over explicit parts.
    pub fn new(
        registry: Arc<AgentRegistry>,
        repository: Arc<dyn ChatRepository>,
        abort: Arc<StreamAbortFabric>,
    ) -> Self {
        Self {
            registry,
            repository,
            abort,
        }
    }
}

/// All chat routes, to be nested under the API base path.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat/stream", post(stream_chat))
        .route("/chat/stop", post(stop_stream))
        .route("/chat/agents", get(list_agents))
        .route("/chat/threads", get(list_threads))
        .route(
            "/chat/threads/{id}",
            get(get_thread).patch(patch_thread).delete(delete_thread),
        )
        .route("/chat/threads/{id}/restore", post(restore_thread))
        .route("/chat/threads/{id}/permanent", delete(permanent_delete_thread))
        .route("/chat/threads/{id}/bookmark", post(toggle_bookmark))
        .route("/chat/threads/{id}/messages", get(list_messages))
        .route("/chat/threads/{id}/messages/last", get(last_message))
        .route("/chat/threads/{id}/messages/count", get(count_messages))
        .route("/chat/status", get(status))
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────────────────

/// HTTP-layer failure, mapped onto the status-code contract.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Forbidden,
    NotFound,
    Conflict,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "access denied".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "thread not found".to_string()),
            ApiError::Conflict => (StatusCode::CONFLICT, "etag mismatch".to_string()),
            ApiError::Internal(message) => {
                log::error!("internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<crate::agentstream::repository::RepoError> for ApiError {
    fn from(e: crate::agentstream::repository::RepoError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

// ── Request/response bodies ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StreamChatRequest {
    pub thread_id: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub conversation_style: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ThreadPatchBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_bookmarked: Option<bool>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListThreadsQuery {
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub is_bookmarked: Option<bool>,
    #[serde(default)]
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub role: Option<ChatRole>,
}

// ── Helpers ──────────────────────────────────────────────────────────

fn require_user_header(headers: &axum::http::HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| ApiError::Validation("missing X-User-Id header".to_string()))
}

fn if_match_header(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("if-match")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
}

/// Load a thread and enforce ownership: 404 when absent, 403 when owned
/// by someone else.
async fn load_owned_thread(
    state: &AppState,
    thread_id: &str,
    user_id: &str,
    include_deleted: bool,
) -> Result<Thread, ApiError> {
    let thread = state
        .repository
        .get_thread(thread_id, include_deleted)
        .await?
        .ok_or(ApiError::NotFound)?;
    if thread.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(thread)
}

fn outcome_to_response<T>(outcome: UpdateOutcome<T>) -> Result<T, ApiError> {
    match outcome {
        UpdateOutcome::Updated(item) => Ok(item),
        UpdateOutcome::Conflict => Err(ApiError::Conflict),
        UpdateOutcome::NotFound => Err(ApiError::NotFound),
    }
}

// ── Streaming ────────────────────────────────────────────────────────

async fn stream_chat(
    State(state): State<AppState>,
    Json(body): Json<StreamChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.thread_id.is_empty() || body.user_id.is_empty() {
        return Err(ApiError::Validation(
            "thread_id and user_id are required".to_string(),
        ));
    }
    if body.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".to_string()));
    }

    let agent_name = body.agent_type.clone().unwrap_or_else(|| "normal".to_string());
    let agent = state
        .registry
        .get(&agent_name)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    // A duplicate in-flight turn for the same thread is aborted here.
    let abort = state.abort.register(&body.thread_id).await;

    let history = deduplicate_by_id(&body.messages);
    let ctx = AgentContext::new(&body.user_id, &body.thread_id, history);

    let mut turn = TurnConfig::default().with_abort(abort);
    turn.max_tokens = body.max_tokens;
    turn.temperature = body.temperature;
    turn.system_prompt = body.system_prompt.clone();
    if let Some(style) = &body.conversation_style {
        turn = turn.with_style(style);
    }

    if log::log_enabled!(log::Level::Info) {
        log::info!(
            "stream_chat: thread={} user={} agent={} trace={}",
            body.thread_id,
            body.user_id,
            agent_name,
            ctx.trace_id
        );
    }

    let repository = state.repository.clone();
    let fabric = state.abort.clone();
    let thread_id = body.thread_id.clone();
    let user_id = body.user_id.clone();
    let trace_id = ctx.trace_id;
    let user_message = ctx
        .message_history
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .cloned();

    let mut inner = agent.run(ctx, turn);
    let sse_stream = async_stream::stream! {
        let mut reply = String::new();

        while let Some(item) = inner.next().await {
            match item {
                AgentItem::Event(event) => {
                    if let StreamEvent::Data { chunk } = &event {
                        reply.push_str(chunk);
                    }
                    yield Ok::<_, Infallible>(to_sse_event(&event));
                }
                // Handoffs are control-plane; nothing goes on the wire.
                AgentItem::Handoff(_) => {}
            }
        }

        // Persist the turn. Failures are logged and swallowed — the
        // client already received the reply. Partial content from an
        // errored stream is persisted as-is.
        persist_turn(
            &repository,
            &thread_id,
            &user_id,
            trace_id,
            user_message.as_ref(),
            &reply,
        )
        .await;

        fabric.unregister(&thread_id).await;
    };

    Ok((
        stream_headers(),
        Sse::new(sse_stream).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(crate::agentstream::sse::HEARTBEAT_INTERVAL_SECS))
                .text(crate::agentstream::sse::HEARTBEAT_COMMENT),
        ),
    ))
}

/// Persist user message and assistant reply after a stream ends.
async fn persist_turn(
    repository: &Arc<dyn ChatRepository>,
    thread_id: &str,
    user_id: &str,
    trace_id: Uuid,
    user_message: Option<&ChatMessage>,
    reply: &str,
) {
    let created = repository
        .create_thread(NewThread {
            id: Some(thread_id.to_string()),
            user_id: user_id.to_string(),
            title: user_message.map(|m| title_from(&m.content)),
            metadata: None,
            trace_id: Some(trace_id.to_string()),
        })
        .await;
    if let Err(e) = created {
        log::warn!("persist_turn: thread create failed for {}: {}", thread_id, e);
        return;
    }

    if let Some(message) = user_message {
        let stored = repository
            .upsert_message(NewMessage {
                id: message.id.clone(),
                thread_id: thread_id.to_string(),
                user_id: user_id.to_string(),
                role: ChatRole::User,
                content: message.content.clone(),
                metadata: message.metadata.clone(),
            })
            .await;
        if let Err(e) = stored {
            log::warn!("persist_turn: user message failed for {}: {}", thread_id, e);
        }
    }

    if !reply.is_empty() {
        let stored = repository
            .upsert_message(NewMessage {
                id: Uuid::now_v7().to_string(),
                thread_id: thread_id.to_string(),
                user_id: user_id.to_string(),
                role: ChatRole::Assistant,
                content: reply.to_string(),
                metadata: None,
            })
            .await;
        if let Err(e) = stored {
            log::warn!(
                "persist_turn: assistant message failed for {}: {}",
                thread_id,
                e
            );
        }
    }
}

/// First line of the first user message, trimmed to a title.
fn title_from(content: &str) -> String {
    let line = content.lines().next().unwrap_or("");
    let title: String = line.chars().take(80).collect();
    title
}

async fn stop_stream(
    State(state): State<AppState>,
    Json(body): Json<StopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.thread_id.is_empty() {
        return Err(ApiError::Validation("thread_id is required".to_string()));
    }
    let stopped = state.abort.request_abort(&body.thread_id).await;
    Ok(Json(serde_json::json!({
        "success": stopped,
        "message": if stopped {
            "stream abort requested"
        } else {
            "no active stream for thread"
        },
    })))
}

async fn list_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "agents": state.registry.list() }))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "active_streams": state.abort.active_count().await,
        "redis_enabled": state.abort.cross_instance(),
        "persistence_enabled": state.repository.is_healthy().await,
    }))
}

// ── Thread CRUD ──────────────────────────────────────────────────────

async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ListThreadsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = query
        .user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::Validation("user_id is required".to_string()))?;

    let mut options = ListThreadsOptions::for_user(user_id);
    if let Some(limit) = query.limit {
        options.limit = limit;
    }
    options.continuation_token = query.continuation_token;
    options.is_bookmarked = query.is_bookmarked;
    options.include_deleted = query.include_deleted.unwrap_or(false);

    let page = state.repository.list_threads(options).await?;
    Ok(Json(serde_json::to_value(page).unwrap_or_default()))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Thread>, ApiError> {
    let user_id = require_user_header(&headers)?;
    let thread = load_owned_thread(&state, &thread_id, &user_id, false).await?;
    Ok(Json(thread))
}

async fn patch_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<ThreadPatchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, false).await?;

    let updates = ThreadUpdate {
        title: body.title,
        is_bookmarked: body.is_bookmarked,
        metadata: body.metadata,
    };
    let options = WriteOptions {
        if_match: if_match_header(&headers),
        retry_on_conflict: false,
    };
    let thread = outcome_to_response(
        state
            .repository
            .update_thread(&user_id, &thread_id, updates, options)
            .await?,
    )?;
    let etag = thread.etag.clone();
    Ok(Json(serde_json::json!({ "thread": thread, "etag": etag })))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, false).await?;

    let options = WriteOptions {
        if_match: if_match_header(&headers),
        retry_on_conflict: false,
    };
    outcome_to_response(
        state
            .repository
            .delete_thread(&user_id, &thread_id, options)
            .await?,
    )?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn restore_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, true).await?;

    let options = WriteOptions {
        if_match: if_match_header(&headers),
        retry_on_conflict: false,
    };
    let thread = outcome_to_response(
        state
            .repository
            .restore_thread(&user_id, &thread_id, options)
            .await?,
    )?;
    let etag = thread.etag.clone();
    Ok(Json(serde_json::json!({ "thread": thread, "etag": etag })))
}

async fn permanent_delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, true).await?;

    let removed = state
        .repository
        .hard_delete_thread(&user_id, &thread_id)
        .await?;
    Ok(Json(serde_json::json!({ "success": removed })))
}

async fn toggle_bookmark(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    let thread = load_owned_thread(&state, &thread_id, &user_id, false).await?;

    let updates = ThreadUpdate {
        is_bookmarked: Some(!thread.is_bookmarked),
        ..ThreadUpdate::default()
    };
    let thread = outcome_to_response(
        state
            .repository
            .update_thread(&user_id, &thread_id, updates, WriteOptions::default())
            .await?,
    )?;
    let bookmarked = thread.is_bookmarked;
    Ok(Json(serde_json::json!({
        "thread": thread,
        "is_bookmarked": bookmarked,
    })))
}

// ── Messages ─────────────────────────────────────────────────────────

async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, false).await?;

    let options = ListMessagesOptions {
        limit: query.limit.unwrap_or(0),
        continuation_token: query.continuation_token,
        role: query.role,
        include_deleted: false,
    };
    let page = state
        .repository
        .get_messages(&user_id, &thread_id, options)
        .await?;
    Ok(Json(serde_json::to_value(page).unwrap_or_default()))
}

async fn last_message(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, false).await?;

    let message = state
        .repository
        .get_last_message(&user_id, &thread_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::to_value(message).unwrap_or_default()))
}

async fn count_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user_header(&headers)?;
    load_owned_thread(&state, &thread_id, &user_id, false).await?;

    let count = state.repository.count_messages(&user_id, &thread_id).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}
