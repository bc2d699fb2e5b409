//! OpenRouter chat-completions client with SSE streaming
//!
//! Used by the bridge's `openrouter` backend to turn a planner prompt into
//! plan text. Transient transport failures are retried with backoff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::planner::PlanModel;
use crate::sse::{self, SseEvent};

pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 120;
/// Max attempts for transient errors
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff (ms)
const RETRY_BASE_DELAY_MS: u64 = 500;

const SYSTEM_PROMPT: &str =
    "You plan number-theory computations. Answer with a single JSON object and nothing else.";

/// Token usage statistics
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Stream events from the API
#[derive(Debug)]
pub enum StreamEvent {
    /// A token/chunk of text
    Token(String),
    /// Stream finished with usage stats
    Done(TokenUsage),
    /// Error occurred
    Error(String),
}

pub struct OpenRouter {
    client: reqwest::Client,
    api_key: String,
    url: String,
}

impl OpenRouter {
    pub fn new(client: reqwest::Client, api_key: &str) -> Self {
        Self::with_url(client, api_key, OPENROUTER_API_URL)
    }

    pub fn with_url(client: reqwest::Client, api_key: &str, url: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            url: url.to_string(),
        }
    }

    /// Stream a chat completion; events arrive on the returned channel
    pub fn stream_completion(&self, model: &str, prompt: &str) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(256);

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: true,
            max_tokens: Some(4096),
            temperature: Some(0.2),
        };

        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            match do_stream(&client, &url, &api_key, &request, &tx).await {
                Ok(usage) => {
                    let _ = tx.send(StreamEvent::Done(usage)).await;
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                }
            }
        });

        rx
    }
}

#[async_trait]
impl PlanModel for OpenRouter {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String> {
        let mut rx = self.stream_completion(model, prompt);
        let mut response = String::new();

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(t) => response.push_str(&t),
                StreamEvent::Done(usage) => {
                    tracing::debug!(%model, total_tokens = usage.total_tokens, "completion finished");
                    break;
                }
                StreamEvent::Error(e) => return Err(Error::Transport(e)),
            }
        }

        Ok(response)
    }
}

fn is_retryable(e: &Error) -> bool {
    match e {
        Error::Transport(_) => true,
        Error::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

/// Perform the streaming request with retry
async fn do_stream(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    request: &ChatRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<TokenUsage> {
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            // Exponential backoff: 500ms, 1s
            let delay = RETRY_BASE_DELAY_MS * (1 << (attempt - 1));
            tracing::debug!(attempt, delay_ms = delay, "retrying completion");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match do_stream_attempt(client, url, api_key, request, tx).await {
            Ok(usage) => return Ok(usage),
            Err(e) if is_retryable(&e) => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Transport("Max retries exceeded".into())))
}

/// Single attempt at streaming request
async fn do_stream_attempt(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    request: &ChatRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<TokenUsage> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .header("X-Title", "ntquery")
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .json(request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Http {
            status: status.as_u16(),
            message: format!("API error {}: {}", status, body),
        });
    }

    let (ev_tx, mut ev_rx) = mpsc::channel::<SseEvent>(64);
    let pump = tokio::spawn(sse::pump(response, ev_tx));

    let mut usage = TokenUsage::default();
    while let Some(ev) = ev_rx.recv().await {
        if ev.data == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(&ev.data) else {
            continue;
        };
        if let Some(content) = chunk
            .choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .and_then(|d| d.content.as_ref())
        {
            if !content.is_empty() {
                let _ = tx.send(StreamEvent::Token(content.clone())).await;
            }
        }
        if let Some(u) = chunk.usage {
            usage = TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            };
        }
    }

    pump.await
        .map_err(|e| Error::Transport(format!("stream task failed: {}", e)))??;
    Ok(usage)
}

// ═══════════════════════════════════════════════════════════════
// API Types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};

    #[test]
    fn test_parse_stream_chunk() {
        let json = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("Hello")
        );
    }

    #[tokio::test]
    async fn test_complete_collects_streamed_tokens() {
        async fn completions() -> &'static str {
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"steps\\\":\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"[]}\"}}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n\
             data: [DONE]\n\n"
        }

        let app = Router::new().route("/v1/chat/completions", post(completions));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = OpenRouter::with_url(
            reqwest::Client::new(),
            "key",
            &format!("http://{}/v1/chat/completions", addr),
        );
        assert_eq!(client.complete("p", "m").await.unwrap(), "{\"steps\":[]}");
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        use axum::http::StatusCode;
        async fn denied() -> (StatusCode, &'static str) {
            (StatusCode::UNAUTHORIZED, "bad key")
        }

        let app = Router::new().route("/c", post(denied));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = OpenRouter::with_url(reqwest::Client::new(), "key", &format!("http://{}/c", addr));
        let err = client.complete("p", "m").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
