//! Local provider speaking newline-delimited JSON.
//!
//! The chat endpoint responds with one JSON object per line, each carrying
//! an incremental `message.content` delta and a `done` flag on the final
//! object. Byte chunks from the network can split lines arbitrarily, so the
//! adapter buffers across chunk boundaries and emits one [`TokenChunk`]
//! per complete line.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

use crate::agentstream::event::ChatMessage;
use crate::agentstream::llm::http_pool::get_shared_http_client;
use crate::agentstream::llm::{
    backoff_delay, wire_messages, CompletionOptions, LlmClient, LlmError, TokenChunk, TokenStream,
    MAX_RETRIES,
};

/// Local models routinely need longer than remote deployments.
const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);
/// Streaming deadline when the caller supplied none.
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(90);

/// Client for an Ollama-compatible local chat server.
pub struct OllamaClient {
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn body(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages(messages, options),
            "stream": stream,
        });
        let mut model_options = serde_json::Map::new();
        if let Some(max_tokens) = options.max_tokens {
            model_options.insert("num_predict".to_string(), serde_json::json!(max_tokens));
        }
        if let Some(temperature) = options.temperature {
            model_options.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if !model_options.is_empty() {
            body["options"] = serde_json::Value::Object(model_options);
        }
        if options.json_mode {
            body["format"] = serde_json::json!("json");
        }
        body
    }

    async fn post_with_retry(
        &self,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let mut attempt = 0;
        loop {
            let result = match get_shared_http_client()
                .post(&url)
                .timeout(deadline)
                .json(body)
                .send()
                .await
            {
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
                    self.base_url, deadline
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
                            "OllamaClient: transient failure (attempt {}): {}",
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

/// Extract the content delta and done flag from one NDJSON line.
fn parse_line(line: &str) -> Result<(Option<String>, bool), LlmError> {
    let parsed: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| LlmError::upstream(format!("malformed NDJSON line: {}", e)))?;
    if let Some(err) = parsed.get("error").and_then(|v| v.as_str()) {
        return Err(LlmError::upstream(err.to_string()));
    }
    let content = parsed
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let done = parsed.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
    Ok((content, done))
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream, LlmError> {
        let body = self.body(messages, options, true);
        let deadline = options.timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT);
        let response = self.post_with_retry(&body, deadline).await?;

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let error = if e.is_timeout() {
                            LlmError::timeout("stream deadline elapsed")
                        } else {
                            LlmError::upstream(format!("stream interrupted: {}", e))
                        };
                        yield TokenChunk::Error(error);
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_line(line) {
                        Ok((content, done)) => {
                            if let Some(content) = content {
                                yield TokenChunk::Content(content);
                            }
                            if done {
                                yield TokenChunk::Done;
                                return;
                            }
                        }
                        Err(e) => {
                            yield TokenChunk::Error(e);
                            return;
                        }
                    }
                }
            }
            // Connection closed without a final done object: still complete.
            yield TokenChunk::Done;
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
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::upstream("completion response had no content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_extracts_delta() {
        let (content, done) =
            parse_line(r#"{"message":{"content":"hel"},"done":false}"#).unwrap();
        assert_eq!(content.as_deref(), Some("hel"));
        assert!(!done);
    }

    #[test]
    fn parse_line_final_object() {
        let (content, done) = parse_line(r#"{"message":{"content":""},"done":true}"#).unwrap();
        assert!(content.is_none());
        assert!(done);
    }

    #[test]
    fn parse_line_surfaces_server_error() {
        let err = parse_line(r#"{"error":"model not found"}"#).unwrap_err();
        assert!(err.message.contains("model not found"));
    }
}
