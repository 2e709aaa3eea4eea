//! Turn event system.
//!
//! Every conversation turn produces an ordered sequence of [`StreamEvent`]s:
//! exactly one [`Metadata`](StreamEvent::Metadata) first, then any number of
//! [`AgentUpdated`](StreamEvent::AgentUpdated) and [`Data`](StreamEvent::Data)
//! events, terminated by exactly one [`Done`](StreamEvent::Done) on success or
//! one [`Error`](StreamEvent::Error) on failure. The SSE encoder
//! ([`crate::sse`]) frames each event onto the HTTP response; agents
//! ([`crate::agents`]) are the producers.
//!
//! # Event Flow (plain turn)
//!
//! ```text
//! Metadata { trace_id }
//!   └─ AgentUpdated { agent_name: "PlainAgent", content_type: FinalAnswer }
//!   └─ Data { chunk: "4" }
//!   └─ Data { chunk: " is the answer" }
//! Done
//! ```
//!
//! # Example
//!
//! ```rust
//! use agentstream::event::{ErrorCode, StreamEvent};
//! use uuid::Uuid;
//!
//! let ev = StreamEvent::data("hello");
//! assert_eq!(ev.kind(), "data");
//! assert_eq!(ev.payload()["chunk"], "hello");
//!
//! let err = StreamEvent::error(ErrorCode::Timeout, "provider took too long");
//! assert!(err.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Closed set of machine-readable error codes carried by
/// [`StreamEvent::Error`].
///
/// The set is part of the wire contract: clients switch on these values, so
/// new failure modes must map onto an existing code or extend this enum (a
/// breaking change).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The event stream itself failed (client gone, transport torn down).
    StreamError,
    /// An agent raised an internal failure while producing events.
    AgentError,
    /// A per-call deadline elapsed before a terminal item arrived.
    Timeout,
    /// The upstream provider rejected the call for quota reasons.
    RateLimit,
    /// The referenced thread/session does not exist.
    SessionNotFound,
    /// A broken invariant inside this service.
    InternalError,
    /// The upstream provider failed in a non-retryable way.
    UpstreamError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::AgentError => "AGENT_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// A reference to a retrieved document, attached to metadata events by
/// retrieval-grounded agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Citation {
    /// Document title shown to the user.
    pub title: String,
    /// Originating collection or system, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Short excerpt from the matched region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Link to the document, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Page number inside the document, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// Whether an [`StreamEvent::AgentUpdated`] announces working notes or the
/// final answer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Intermediate reasoning/progress the client may render dimmed.
    Thoughts,
    /// The chunks that follow belong to the user-facing reply.
    FinalAnswer,
}

/// One event on a turn's stream.
///
/// Concatenating the `chunk` fields of all [`Data`](StreamEvent::Data)
/// events yields the assistant reply that the controller persists after the
/// stream completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event on every stream. Carries the turn's trace id and any
    /// citations accumulated so far (retrieval agents emit a second
    /// metadata event once their citations are known).
    Metadata {
        /// UUIDv7 identifying this turn across logs and events.
        trace_id: Uuid,
        /// Documents backing the reply; empty on the opening event.
        citations: Vec<Citation>,
        /// Stream identity, set when the producer distinguishes retries.
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<Uuid>,
    },
    /// The active agent changed, or an agent switched between thinking and
    /// answering.
    AgentUpdated {
        /// Display name of the agent now producing events.
        agent_name: String,
        /// Channel the following `Data` events belong to.
        content_type: ContentType,
        /// Short human-readable description of what the agent is doing.
        #[serde(skip_serializing_if = "Option::is_none")]
        job_description: Option<String>,
    },
    /// An incremental piece of the assistant reply.
    Data {
        /// Token(s) in emission order.
        chunk: String,
    },
    /// Terminal success. Exactly one per successful stream; nothing may
    /// follow it.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<Uuid>,
    },
    /// Terminal failure. At most one per stream, mutually exclusive with
    /// `Done`.
    Error {
        /// Human-readable description. Never carries stack traces or
        /// secrets.
        message: String,
        /// Machine-readable code from the closed set.
        code: ErrorCode,
    },
}

impl StreamEvent {
    /// Opening metadata event with no citations.
    pub fn metadata(trace_id: Uuid) -> Self {
        StreamEvent::Metadata {
            trace_id,
            citations: Vec::new(),
            stream_id: None,
        }
    }

    /// Metadata event carrying accumulated citations.
    pub fn metadata_with_citations(trace_id: Uuid, citations: Vec<Citation>) -> Self {
        StreamEvent::Metadata {
            trace_id,
            citations,
            stream_id: None,
        }
    }

    /// Agent transition event.
    pub fn agent_updated(
        agent_name: impl Into<String>,
        content_type: ContentType,
        job_description: Option<String>,
    ) -> Self {
        StreamEvent::AgentUpdated {
            agent_name: agent_name.into(),
            content_type,
            job_description,
        }
    }

    /// Reply chunk event.
    pub fn data(chunk: impl Into<String>) -> Self {
        StreamEvent::Data {
            chunk: chunk.into(),
        }
    }

    /// Terminal success event.
    pub fn done() -> Self {
        StreamEvent::Done { stream_id: None }
    }

    /// Terminal failure event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            code,
        }
    }

    /// Wire name of this event's kind, used for the SSE `event:` line.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Metadata { .. } => "metadata",
            StreamEvent::AgentUpdated { .. } => "agent_updated",
            StreamEvent::Data { .. } => "data",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Kind-specific payload without the `kind` discriminator, as framed
    /// into the SSE `data:` lines.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.remove("kind");
        }
        value
    }

    /// `true` for `Done` and `Error`, the two events that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Conversation roles accepted on the turn input and stored with messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::System => write!(f, "system"),
        }
    }
}

/// One message of a turn's input history.
///
/// Ordering is positional; `id` is client-supplied and treated as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Opaque client-supplied identifier, reused for idempotent upserts.
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    /// Free-form metadata carried through to persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn new(id: impl Into<String>, role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            metadata: None,
        }
    }
}

/// Per-turn context handed by value to every agent invocation.
///
/// Agents never mutate the context; the orchestrator clones it per phase.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// UUIDv7 for this turn, echoed in the opening metadata event.
    pub trace_id: Uuid,
    pub user_id: String,
    pub thread_id: String,
    /// Full input history for the turn, oldest first.
    pub message_history: Vec<ChatMessage>,
    /// Free-form per-turn values (conversation style, request metadata).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentContext {
    /// Build a context for a turn. Generates a fresh UUIDv7 trace id.
    pub fn new(
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        message_history: Vec<ChatMessage>,
    ) -> Self {
        Self {
            trace_id: Uuid::now_v7(),
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            message_history,
            metadata: HashMap::new(),
        }
    }

    /// Content of the most recent user message, or the empty string when
    /// the history has none.
    pub fn latest_user_message(&self) -> &str {
        self.message_history
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_drops_kind_discriminator() {
        let ev = StreamEvent::data("chunk");
        let payload = ev.payload();
        assert!(payload.get("kind").is_none());
        assert_eq!(payload["chunk"], "chunk");
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let ev = StreamEvent::error(ErrorCode::RateLimit, "slow down");
        assert_eq!(ev.payload()["code"], "RATE_LIMIT");
    }

    #[test]
    fn latest_user_message_skips_assistant() {
        let ctx = AgentContext::new(
            "u1",
            "t1",
            vec![
                ChatMessage::new("m1", ChatRole::User, "first"),
                ChatMessage::new("m2", ChatRole::Assistant, "reply"),
            ],
        );
        assert_eq!(ctx.latest_user_message(), "first");
    }
}
