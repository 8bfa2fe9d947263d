//! OpenAI-compatible chat client (DashScope compatible mode by default).
//! Connection pooling via reqwest, manual SSE parsing, retry on 429 / 5xx /
//! timeout.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LlmConfig;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm not configured: {0}")]
    NotConfigured(String),
    #[error("llm api error: {0}")]
    Api(String),
    #[error("rate limited")]
    RateLimited,
    #[error("llm request timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Blocking reply generation for the conversation thread.
pub trait ReplyGenerator: Send + Sync {
    fn reply(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

pub struct ChatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    runtime: Handle,
    cancel: CancellationToken,
}

impl ChatClient {
    pub fn new(
        cfg: &LlmConfig,
        api_key: String,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::NotConfigured("empty api key".into()));
        }
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            runtime,
            cancel,
        })
    }

    /// Stream one completion and return the concatenated content.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": 0.7
        });

        let response = self.send_with_retry(&body).await?;
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = tokio::select! {
            chunk = stream.next() => chunk,
            _ = self.cancel.cancelled() => return Err(LlmError::Cancelled),
        } {
            let bytes = chunk.map_err(|e| LlmError::Api(e.to_string()))?;
            parser.push(&bytes);
        }
        let text = parser.finish();
        debug!(chars = text.chars().count(), "llm reply received");
        Ok(text)
    }

    /// 429: Retry-After or 1s/2s/4s (max 3). 5xx: backoff (max 2).
    /// Timeout: one immediate retry.
    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            let wait = match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= max_429_retries {
                        return Err(LlmError::RateLimited);
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    wait
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(LlmError::Api(format!("server error: {}", resp.status())));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    wait
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(LlmError::Api(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(LlmError::Timeout);
                    }
                    warn!("llm request timeout, retrying once");
                    timeout_retried = true;
                    continue;
                }
                Err(e) => return Err(LlmError::Api(e.to_string())),
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => return Err(LlmError::Cancelled),
            }
            attempt += 1;
        }
    }
}

impl ReplyGenerator for ChatClient {
    fn reply(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.runtime.block_on(self.complete(messages))
    }
}

/// Incremental `data: {...}` line parser for chat-completion SSE streams.
/// Buffers raw bytes so multi-byte characters split across chunks survive.
#[derive(Default)]
pub struct SseParser {
    line_buf: Vec<u8>,
    text: String,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) {
        self.line_buf.extend_from_slice(chunk);
        while let Some(newline_pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=newline_pos).collect();
            self.handle_line(String::from_utf8_lossy(&line).trim());
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return;
        }
        if let Ok(parsed) = serde_json::from_str::<SseChunk>(data) {
            if let Some(content) = parsed.choices.first().and_then(|c| c.delta.content.as_deref()) {
                self.text.push_str(content);
            }
        }
    }

    pub fn finish(mut self) -> String {
        let rest = std::mem::take(&mut self.line_buf);
        self.handle_line(String::from_utf8_lossy(&rest).trim());
        self.text
    }
}

#[derive(Deserialize)]
struct SseChunk {
    choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
    delta: SseDelta,
}

#[derive(Deserialize)]
struct SseDelta {
    content: Option<String>,
}
