//! Gemini API client.
//!
//! A thin reqwest wrapper behind the [`Upstream`] trait, so the dispatcher
//! and its tests can swap in scripted backends. Streaming uses the SSE
//! variant of the generate endpoint and decodes `data:` frames into JSON
//! events.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::info;

const API_KEY_HEADER: &str = "x-goog-api-key";
/// Upstream error bodies are truncated to this many characters.
const ERROR_BODY_MAX_CHARS: usize = 2000;

/// Failure of a single upstream attempt. `status` is the HTTP status when
/// one was observed; transport-level failures default to 500.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub status: u16,
    pub message: String,
}

impl UpstreamError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}: {}", self.status, self.message)
    }
}

impl std::error::Error for UpstreamError {}

pub type EventStream = BoxStream<'static, Result<Value, UpstreamError>>;

/// The upstream capability set the dispatcher drives.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError>;

    async fn stream_generate_content(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
    ) -> Result<EventStream, UpstreamError>;

    async fn count_tokens(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError>;
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, crate::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::Error::Config(format!("http client: {e}")))?;
        info!(base_url, timeout_secs = timeout.as_secs(), "Upstream client initialized");
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, model: &str, action: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, action)
    }

    async fn post_json(&self, url: String, key: &str, payload: &Value) -> Result<Value, UpstreamError> {
        let resp = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, key)
            .json(payload)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError {
                status: status.as_u16(),
                message: truncate(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        resp.json()
            .await
            .map_err(|e| UpstreamError::transport(format!("invalid response json: {e}")))
    }
}

#[async_trait]
impl Upstream for GeminiClient {
    async fn generate_content(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        self.post_json(self.url(model, "generateContent"), key, payload)
            .await
    }

    async fn count_tokens(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        self.post_json(self.url(model, "countTokens"), key, payload)
            .await
    }

    async fn stream_generate_content(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
    ) -> Result<EventStream, UpstreamError> {
        let url = format!("{}?alt=sse", self.url(model, "streamGenerateContent"));
        let resp = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, key)
            .json(payload)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError {
                status: status.as_u16(),
                message: truncate(&body, ERROR_BODY_MAX_CHARS),
            });
        }

        let mut decoder = SseDecoder::new();
        let events = resp
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => Ok(decoder.feed(&bytes)),
                Err(e) => Err(UpstreamError::transport(format!("stream failed: {e}"))),
            })
            .flat_map(|item| match item {
                Ok(payloads) => {
                    stream::iter(payloads.into_iter().map(parse_event).collect::<Vec<_>>())
                }
                Err(e) => stream::iter(vec![Err(e)]),
            })
            .boxed();
        Ok(events)
    }
}

fn parse_event(data: String) -> Result<Value, UpstreamError> {
    serde_json::from_str(&data)
        .map_err(|e| UpstreamError::transport(format!("invalid event json: {e}")))
}

/// Character-bounded truncation with an ellipsis marker.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Incremental SSE decoder: accumulates raw bytes and yields the payload
/// of each completed `data:` line. Comment and event lines are dropped.
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}
