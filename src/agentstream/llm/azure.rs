//! Remote-chat provider speaking Azure-OpenAI style chat completions.
//!
//! Streaming requests carry `"stream": true` and the endpoint pushes
//! incremental SSE chunks (`data: {json}` frames ending with a
//! `data: [DONE]` sentinel); the client adapts those chunk events onto the
//! unified [`TokenChunk`] shape via `eventsource-stream`. Completions POST
//! the same body without the stream flag and read a single JSON response.
//!
//! Transient upstream failures (408, 429, 5xx) are retried with bounded
//! exponential backoff before surfacing; everything else maps to
//! `UPSTREAM_ERROR` immediately.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use std::time::Duration;

use crate::agentstream::event::ChatMessage;
use crate::agentstream::llm::http_pool::get_shared_http_client;
use crate::agentstream::llm::{
    backoff_delay, wire_messages, CompletionOptions, LlmClient, LlmError, TokenChunk, TokenStream,
    MAX_RETRIES,
};

/// Completion deadline when the caller supplied none.
const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);
/// Streaming deadline when the caller supplied none.
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(90);

/// Client for an Azure-OpenAI style chat deployment.
pub struct AzureChatClient {
    endpoint: String,
    api_key: String,
    deployment: String,
    api_version: String,
}

impl AzureChatClient {
    /// Construct a client for `{endpoint}/openai/deployments/{deployment}`.
    pub fn new(endpoint: &str, api_key: &str, deployment: &str, api_version: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            deployment: deployment.to_string(),
            api_version: api_version.to_string(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    fn body(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "messages": wire_messages(messages, options),
            "stream": stream,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if options.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }

    /// POST with bounded retry on transient statuses. Returns the raw
    /// response on 2xx.
    async fn post_with_retry(
        &self,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<reqwest::Response, LlmError> {
        let mut attempt = 0;
        loop {
            let send = get_shared_http_client()
                .post(self.url())
                .header("api-key", &self.api_key)
                .timeout(deadline)
                .json(body)
                .send();

            let result = match send.await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let text = resp.text().await.unwrap_or_default();
                    Err(LlmError::from_status(status.as_u16(), &text))
                }
                Err(e) if e.is_timeout() => Err(LlmError::timeout(format!(
                    "no response from {} within {:?}",
                    self.endpoint, deadline
                ))),
                Err(e) => Err(LlmError {
                    retryable: e.is_connect(),
                    ..LlmError::upstream(e.to_string())
                }),
            };

            match result {
                Err(err) if err.retryable && attempt < MAX_RETRIES => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(
                            "AzureChatClient: transient failure (attempt {}): {}",
                            attempt + 1,
                            err
                        );
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl LlmClient for AzureChatClient {
    fn provider_name(&self) -> &str {
        "azure"
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream, LlmError> {
        let body = self.body(messages, options, true);
        let deadline = options.timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT);
        let response = self.post_with_retry(&body, deadline).await?;

        let mut events = response.bytes_stream().eventsource();
        let stream = async_stream::stream! {
            let mut finished = false;
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            finished = true;
                            yield TokenChunk::Done;
                            break;
                        }
                        let parsed: serde_json::Value = match serde_json::from_str(&event.data) {
                            Ok(v) => v,
                            Err(e) => {
                                yield TokenChunk::Error(LlmError::upstream(format!(
                                    "malformed chunk: {}",
                                    e
                                )));
                                finished = true;
                                break;
                            }
                        };
                        let delta = parsed
                            .get("choices")
                            .and_then(|c| c.get(0))
                            .and_then(|c| c.get("delta"))
                            .and_then(|d| d.get("content"))
                            .and_then(|v| v.as_str());
                        if let Some(content) = delta {
                            if !content.is_empty() {
                                yield TokenChunk::Content(content.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        let error = match &e {
                            eventsource_stream::EventStreamError::Transport(inner)
                                if inner.is_timeout() =>
                            {
                                LlmError::timeout("stream deadline elapsed")
                            }
                            _ => LlmError::upstream(format!("stream interrupted: {}", e)),
                        };
                        yield TokenChunk::Error(error);
                        finished = true;
                        break;
                    }
                }
            }
            // Upstream closed without the sentinel: still a complete stream.
            if !finished {
                yield TokenChunk::Done;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let deadline = options.timeout.unwrap_or(DEFAULT_COMPLETION_TIMEOUT);
        let body = self.body(messages, options, false);
        let response = self.post_with_retry(&body, deadline).await?;

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::upstream(format!("malformed completion body: {}", e)))?;

        parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::upstream("completion response had no content"))
    }
}
