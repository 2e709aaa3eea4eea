//! Unified streaming/completion façade over LLM providers.
//!
//! Applications interact with the token source through the [`LlmClient`]
//! trait and the lightweight data types defined here. The trait abstracts
//! over concrete provider implementations while [`TokenChunk`] describes
//! the unified streaming shape: zero or more `Content` items in emission
//! order, then exactly one `Done`, or a single `Error` that ends the
//! sequence.
//!
//! Three providers sit behind the façade:
//!
//! - [`azure::AzureChatClient`] — remote chat endpoint with incremental
//!   server-pushed chunks.
//! - [`ollama::OllamaClient`] — newline-delimited JSON objects, each
//!   carrying incremental content.
//! - [`mock::MockLlmClient`] — deterministic, content-dependent replies
//!   with a configurable per-token delay.
//!
//! Selection happens once at startup via [`build_client`]; the process
//! shares a single instance.
//!
//! # Streaming quick start
//!
//! ```rust,no_run
//! use agentstream::event::{ChatMessage, ChatRole};
//! use agentstream::llm::{build_client, CompletionOptions, TokenChunk};
//! use agentstream::config::LlmConfig;
//! use futures_util::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = build_client(&LlmConfig::default());
//! let messages = [ChatMessage::new("m1", ChatRole::User, "2+2?")];
//!
//! let mut stream = client.stream(&messages, &CompletionOptions::streaming()).await?;
//! while let Some(chunk) = stream.next().await {
//!     match chunk {
//!         TokenChunk::Content(text) => print!("{}", text),
//!         TokenChunk::Done => break,
//!         TokenChunk::Error(e) => return Err(e.into()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod azure;
pub mod http_pool;
pub mod mock;
pub mod ollama;

use async_trait::async_trait;
use futures_util::stream::Stream;
use rand::Rng;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::agentstream::config::{LlmConfig, LlmProvider};
use crate::agentstream::event::{ChatMessage, ErrorCode};

/// One item of a unified token stream.
#[derive(Debug, Clone)]
pub enum TokenChunk {
    /// Incremental content delta.
    Content(String),
    /// Terminal failure; the sequence ends after this item.
    Error(LlmError),
    /// Terminal success; the sequence ends after this item.
    Done,
}

/// Type alias for the unified token stream returned by [`LlmClient::stream`].
pub type TokenStream = Pin<Box<dyn Stream<Item = TokenChunk> + Send>>;

/// Provider failure surfaced through the façade.
///
/// `retryable` distinguishes transient upstream failures (handled by the
/// bounded retry inside each provider) from terminal ones.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// Stream-visible code this failure maps to.
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl LlmError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::UpstreamError,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Timeout,
            message: message.into(),
            retryable: false,
        }
    }

    /// Classify an HTTP status from a provider. 408/429/5xx are retryable;
    /// 429 additionally maps to `RATE_LIMIT`.
    pub fn from_status(status: u16, body: &str) -> Self {
        let retryable = status == 408 || status == 429 || status >= 500;
        let code = if status == 429 {
            ErrorCode::RateLimit
        } else {
            ErrorCode::UpstreamError
        };
        Self {
            code,
            message: format!("provider returned HTTP {}: {}", status, truncate(body, 200)),
            retryable,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Error for LlmError {}

/// Per-call options recognized by every provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Upper bound on generated tokens.
    pub max_tokens: Option<u32>,
    /// Sampling temperature in [0, 1].
    pub temperature: Option<f32>,
    /// Overrides the provider's default system prompt.
    pub system_prompt: Option<String>,
    /// Per-call deadline; elapsing surfaces `TIMEOUT`. `None` lets the
    /// provider apply its own default (30 s for remote completions, 60 s
    /// for the local provider).
    pub timeout: Option<Duration>,
    /// Constrain the provider to emit a single JSON object (complete only).
    pub json_mode: bool,
}

impl CompletionOptions {
    /// Defaults for a streamed turn (90 s deadline).
    pub fn streaming() -> Self {
        Self {
            timeout: Some(Duration::from_secs(90)),
            ..Self::default()
        }
    }

    /// Defaults for planner completions (25 s, JSON mode).
    pub fn planner() -> Self {
        Self {
            timeout: Some(Duration::from_secs(25)),
            json_mode: true,
            ..Self::default()
        }
    }

    /// Defaults for ranker completions (20 s, JSON mode).
    pub fn ranker() -> Self {
        Self {
            timeout: Some(Duration::from_secs(20)),
            json_mode: true,
            ..Self::default()
        }
    }
}

/// Trait-driven abstraction over a concrete token source.
///
/// Implementations must be thread-safe: a single instance is shared across
/// every in-flight turn, and all state beyond configuration is per-call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Identifier used in logs and the status endpoint.
    fn provider_name(&self) -> &str;

    /// Open a lazy, finite token stream for the given history.
    ///
    /// Tokens arrive in emission order. On upstream error a single
    /// [`TokenChunk::Error`] is produced and the sequence ends.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream, LlmError>;

    /// Request the full response as one string.
    ///
    /// With `options.json_mode` the provider is constrained to emit a
    /// single JSON object.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;
}

/// Construct the configured provider.
///
/// `LLM_MOCK_MODE` wins over the provider selection so deployments can
/// flip to deterministic replies without touching the rest of their
/// environment.
pub fn build_client(config: &LlmConfig) -> Arc<dyn LlmClient> {
    match config.effective_provider() {
        LlmProvider::Azure => Arc::new(azure::AzureChatClient::new(
            &config.azure_endpoint,
            &config.azure_api_key,
            &config.azure_deployment,
            &config.azure_api_version,
        )),
        LlmProvider::Ollama => Arc::new(ollama::OllamaClient::new(
            &config.ollama_url,
            &config.ollama_model,
        )),
        LlmProvider::Mock => Arc::new(mock::MockLlmClient::new(config.mock_delay_ms)),
    }
}

/// Maximum retry attempts for transient upstream failures.
pub(crate) const MAX_RETRIES: u32 = 2;

/// Exponential backoff with jitter for retry attempt `attempt` (0-based).
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1 << attempt);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Serialize history + options into the provider-neutral wire messages.
///
/// A `system_prompt` option replaces every system message in the history;
/// otherwise history system messages pass through in place.
pub(crate) fn wire_messages(
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> Vec<serde_json::Value> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = &options.system_prompt {
        wire.push(serde_json::json!({ "role": "system", "content": system }));
    }
    for msg in messages {
        if options.system_prompt.is_some() && msg.role == crate::agentstream::event::ChatRole::System {
            continue;
        }
        wire.push(serde_json::json!({
            "role": msg.role.to_string(),
            "content": msg.content,
        }));
    }
    wire
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentstream::event::ChatRole;

    #[test]
    fn status_classification() {
        assert!(LlmError::from_status(429, "slow down").retryable);
        assert_eq!(LlmError::from_status(429, "").code, ErrorCode::RateLimit);
        assert!(LlmError::from_status(503, "").retryable);
        assert!(!LlmError::from_status(400, "bad request").retryable);
    }

    #[test]
    fn system_prompt_option_replaces_history_system_messages() {
        let history = [
            ChatMessage::new("s", ChatRole::System, "old prompt"),
            ChatMessage::new("u", ChatRole::User, "hi"),
        ];
        let mut options = CompletionOptions::default();
        options.system_prompt = Some("new prompt".to_string());

        let wire = wire_messages(&history, &options);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["content"], "new prompt");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn preset_deadlines() {
        assert_eq!(CompletionOptions::planner().timeout, Some(Duration::from_secs(25)));
        assert_eq!(CompletionOptions::ranker().timeout, Some(Duration::from_secs(20)));
        assert_eq!(CompletionOptions::streaming().timeout, Some(Duration::from_secs(90)));
        assert!(CompletionOptions::default().timeout.is_none());
        assert!(CompletionOptions::planner().json_mode);
    }
}
