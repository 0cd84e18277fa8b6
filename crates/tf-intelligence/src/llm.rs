//! Completion-service abstraction.
//!
//! A unified async trait over Anthropic and OpenAI-compatible chat APIs,
//! with a streaming variant and a queue-driven mock for tests. The
//! orchestrator only ever needs `complete(system, user) -> text`; see
//! [`complete_prompt`].

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tf_core::config::{LlmProviderKind, LlmSettings};
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when talking to a completion service.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Connection failure, DNS, TLS, broken stream, ...
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The API returned a non-success status.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("parse error: {0}")]
    ParseError(String),

    /// HTTP 429.
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    /// The environment variable holding the API key is unset or empty.
    #[error("missing API key: environment variable {0} is not set")]
    MissingApiKey(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }
}

/// Per-request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: tf_core::config::DEFAULT_CODE_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    /// Request settings for `model` using the limits from `[llm]`.
    pub fn from_settings(settings: &LlmSettings, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

/// Ordered text chunks; concatenated they equal the full completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Stream a completion response chunk by chunk.
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError>;
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map 429 and other non-success statuses to typed errors.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status().as_u16();

    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(LlmError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::ApiError {
            status,
            message: text,
        });
    }

    Ok(resp)
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes may split anywhere (including inside a UTF-8 sequence), so
/// partial lines are buffered as raw bytes until the next newline. Each
/// `data:` payload is parsed as JSON and handed to the provider-specific
/// extractor.
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
    extract: fn(&serde_json::Value) -> Option<Result<String, LlmError>>,
}

impl SseDecoder {
    pub fn new(extract: fn(&serde_json::Value) -> Option<Result<String, LlmError>>) -> Self {
        Self {
            buffer: Vec::new(),
            done: false,
            extract,
        }
    }

    /// `true` once a `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes; returns every chunk completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, LlmError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(String::from_utf8_lossy(&line).trim(), &mut out);
        }
        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<Result<String, LlmError>> {
        let rest = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        self.decode_line(String::from_utf8_lossy(&rest).trim(), &mut out);
        out
    }

    fn decode_line(&mut self, line: &str, out: &mut Vec<Result<String, LlmError>>) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        match serde_json::from_str::<serde_json::Value>(data) {
            Ok(value) => match (self.extract)(&value) {
                Some(Ok(text)) if text.is_empty() => {}
                Some(chunk) => out.push(chunk),
                None => {}
            },
            Err(e) => debug!(error = %e, "skipping malformed SSE payload"),
        }
    }
}

struct SseState<S> {
    inner: Pin<Box<S>>,
    decoder: SseDecoder,
    queued: VecDeque<Result<String, LlmError>>,
    finished: bool,
}

/// Turn a streaming HTTP body into a [`TextStream`].
fn sse_text_stream<S, B>(
    inner: S,
    extract: fn(&serde_json::Value) -> Option<Result<String, LlmError>>,
) -> TextStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        inner: Box::pin(inner),
        decoder: SseDecoder::new(extract),
        queued: VecDeque::new(),
        finished: false,
    };
    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.queued.pop_front() {
                return Some((chunk, st));
            }
            if st.finished || st.decoder.is_done() {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => {
                    let chunks = st.decoder.push(bytes.as_ref());
                    st.queued.extend(chunks);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(LlmError::from(e)), st));
                }
                None => {
                    st.finished = true;
                    let chunks = st.decoder.finish();
                    st.queued.extend(chunks);
                }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Build the JSON request body for the Messages API.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        // The system prompt goes in the top-level `system` field, not in
        // the messages array.
        let mut system_text: Option<String> = config.system_prompt.clone();

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    if let Some(ref mut s) = system_text {
                        s.push('\n');
                        s.push_str(&msg.content);
                    } else {
                        system_text = Some(msg.content.clone());
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });

        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }

        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        check_status(resp).await
    }

    /// `content_block_delta` events carry text; `error` events abort.
    pub fn extract_stream_event(value: &serde_json::Value) -> Option<Result<String, LlmError>> {
        match value["type"].as_str()? {
            "content_block_delta" => value["delta"]["text"].as_str().map(|t| Ok(t.to_string())),
            "error" => Some(Err(LlmError::ApiError {
                status: 200,
                message: value["error"]["message"]
                    .as_str()
                    .unwrap_or("stream error")
                    .to_string(),
            })),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let resp = self.post(&body).await?;

        let api_resp: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError> {
        let mut body = Self::build_request_body(messages, config);
        body["stream"] = serde_json::Value::Bool(true);
        let resp = self.post(&body).await?;
        Ok(sse_text_stream(resp.bytes_stream(), Self::extract_stream_event))
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Provider for the OpenAI Chat Completions API and compatible local
/// servers (vllm, llama.cpp, Ollama's `/v1` endpoint). Authentication is
/// optional for local servers.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some(api_key.into()),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    /// A local OpenAI-compatible server; `api_key` of `None`, `""` or
    /// `"none"` disables the Authorization header.
    pub fn local(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.is_empty() && k != "none"),
            base_url: base_url.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// System messages go inline, with `config.system_prompt` first.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(ref system) = config.system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": system,
            }));
        }

        for msg in messages {
            api_messages.push(serde_json::json!({
                "role": msg.role.to_string(),
                "content": msg.content,
            }));
        }

        serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_connect() {
                LlmError::HttpError(format!("cannot connect to {}: {}", self.base_url, e))
            } else {
                LlmError::from(e)
            }
        })?;
        check_status(resp).await
    }

    /// `choices[0].delta.content` of a chat-completion chunk.
    pub fn extract_stream_event(value: &serde_json::Value) -> Option<Result<String, LlmError>> {
        if let Some(message) = value["error"]["message"].as_str() {
            return Some(Err(LlmError::ApiError {
                status: 200,
                message: message.to_string(),
            }));
        }
        let choice = value["choices"].get(0)?;
        choice["delta"]["content"]
            .as_str()
            .map(|t| Ok(t.to_string()))
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: Option<String>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageResp,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessageResp {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let resp = self.post(&body).await?;

        let api_resp: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let choice = api_resp
            .choices
            .first()
            .ok_or_else(|| LlmError::ParseError("no choices in response".into()))?;
        let usage = api_resp.usage.as_ref();

        Ok(LlmResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            model: api_resp.model.unwrap_or_else(|| config.model.clone()),
            input_tokens: usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.and_then(|u| u.completion_tokens).unwrap_or(0),
            finish_reason: choice
                .finish_reason
                .clone()
                .unwrap_or_else(|| "stop".into()),
        })
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError> {
        let mut body = Self::build_request_body(messages, config);
        body["stream"] = serde_json::Value::Bool(true);
        let resp = self.post(&body).await?;
        Ok(sse_text_stream(resp.bytes_stream(), Self::extract_stream_event))
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A mock provider for tests.
///
/// Each call pops the next queued response. When the queue is empty a
/// default response is returned. `stream` splits the content into
/// word-sized chunks.
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    /// Captured requests for test assertions.
    #[allow(clippy::type_complexity)]
    captured_requests: Arc<Mutex<Vec<(Vec<LlmMessage>, LlmConfig)>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful response.
    pub fn with_response(self, response: LlmResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue a successful response with just `content`.
    pub fn with_text(self, content: impl Into<String>) -> Self {
        let response = Self::response("mock-model", content.into());
        self.with_response(response)
    }

    /// Queue an error response.
    pub fn with_error(self, error: LlmError) -> Self {
        self.push(Err(error));
        self
    }

    /// Queue a response on a shared provider.
    pub fn push(&self, response: Result<LlmResponse, LlmError>) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(response);
    }

    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmConfig)> {
        self.captured_requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn response(model: &str, content: String) -> LlmResponse {
        LlmResponse {
            content,
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "end_turn".to_string(),
        }
    }

    fn next(&self, messages: &[LlmMessage], config: &LlmConfig) -> Result<LlmResponse, LlmError> {
        self.captured_requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((messages.to_vec(), config.clone()));

        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(Self::response(&config.model, "Mock response".into())))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.next(messages, config)
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError> {
        let response = self.next(messages, config)?;
        let chunks: Vec<Result<String, LlmError>> = response
            .content
            .split_inclusive(' ')
            .map(|c| Ok(c.to_string()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `complete(system_prompt, user_prompt) -> text`.
pub async fn complete_prompt(
    provider: &dyn LlmProvider,
    system: &str,
    user: &str,
    config: &LlmConfig,
) -> Result<String, LlmError> {
    let mut config = config.clone();
    config.system_prompt = Some(system.to_string());
    let response = provider
        .complete(&[LlmMessage::user(user)], &config)
        .await?;
    debug!(
        model = %response.model,
        input_tokens = response.input_tokens,
        output_tokens = response.output_tokens,
        "completion finished"
    );
    Ok(response.content)
}

/// Streaming counterpart of [`complete_prompt`].
pub async fn stream_prompt(
    provider: &dyn LlmProvider,
    system: &str,
    user: &str,
    config: &LlmConfig,
) -> Result<TextStream, LlmError> {
    let mut config = config.clone();
    config.system_prompt = Some(system.to_string());
    provider.stream(&[LlmMessage::user(user)], &config).await
}

/// Concatenate a stream; the first error aborts.
pub async fn collect_stream(mut stream: TextStream) -> Result<String, LlmError> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&chunk?);
    }
    Ok(out)
}

/// Build the provider selected by `[llm]`. API keys come from the
/// environment variable named in `settings.api_key_env`.
pub fn provider_from_settings(settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    let api_key = std::env::var(&settings.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());

    let provider: Arc<dyn LlmProvider> = match settings.provider {
        LlmProviderKind::Anthropic => {
            let key = api_key.ok_or_else(|| LlmError::MissingApiKey(settings.api_key_env.clone()))?;
            let mut p = AnthropicProvider::new(key).with_timeout(timeout);
            if let Some(ref url) = settings.base_url {
                p = p.with_base_url(url.clone());
            }
            Arc::new(p)
        }
        LlmProviderKind::Openai => {
            let key = api_key.ok_or_else(|| LlmError::MissingApiKey(settings.api_key_env.clone()))?;
            let mut p = OpenAiProvider::new(key).with_timeout(timeout);
            if let Some(ref url) = settings.base_url {
                p = p.with_base_url(url.clone());
            }
            Arc::new(p)
        }
        LlmProviderKind::Local => {
            let url = settings
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:8000".to_string());
            Arc::new(OpenAiProvider::local(url, api_key).with_timeout(timeout))
        }
        LlmProviderKind::Mock => Arc::new(MockProvider::new()),
    };
    Ok(provider)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> LlmConfig {
        LlmConfig {
            model: "test-model".to_string(),
            max_tokens: 512,
            temperature: 0.5,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn mock_provider_default_response() {
        let provider = MockProvider::new();
        let resp = provider
            .complete(&[LlmMessage::user("Hello")], &default_config())
            .await
            .unwrap();
        assert_eq!(resp.content, "Mock response");
        assert_eq!(resp.model, "test-model");
    }

    #[tokio::test]
    async fn mock_provider_queue_order() {
        let provider = MockProvider::new()
            .with_text("first")
            .with_error(LlmError::Timeout)
            .with_text("third");
        let cfg = default_config();
        let msgs = [LlmMessage::user("x")];

        assert_eq!(provider.complete(&msgs, &cfg).await.unwrap().content, "first");
        assert!(matches!(
            provider.complete(&msgs, &cfg).await,
            Err(LlmError::Timeout)
        ));
        assert_eq!(provider.complete(&msgs, &cfg).await.unwrap().content, "third");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn stream_concatenates_to_complete_text() {
        let text = "Architecture: microservices with a shared event bus";
        let provider = MockProvider::new().with_text(text);
        let stream = provider
            .stream(&[LlmMessage::user("go")], &default_config())
            .await
            .unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), text);
    }

    #[tokio::test]
    async fn complete_prompt_sets_system_prompt() {
        let provider = MockProvider::new().with_text("ok");
        let out = complete_prompt(&provider, "You are a tester.", "Test it", &default_config())
            .await
            .unwrap();
        assert_eq!(out, "ok");

        let captured = provider.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0[0].content, "Test it");
        assert_eq!(
            captured[0].1.system_prompt.as_deref(),
            Some("You are a tester.")
        );
    }

    #[test]
    fn anthropic_body_lifts_system_messages() {
        let mut cfg = default_config();
        cfg.system_prompt = Some("base".into());
        let body = AnthropicProvider::build_request_body(
            &[LlmMessage::system("extra"), LlmMessage::user("hi")],
            &cfg,
        );
        assert_eq!(body["system"], "base\nextra");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn openai_body_inlines_system_prompt() {
        let mut cfg = default_config();
        cfg.system_prompt = Some("sys".into());
        let body = OpenAiProvider::build_request_body(&[LlmMessage::user("hi")], &cfg);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["content"], "hi");
    }

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::new(OpenAiProvider::extract_stream_event);
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let second = decoder.push(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n");
        let texts: Vec<String> = second.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(texts, vec!["Hello", " world"]);

        assert!(decoder.push(b"data: [DONE]\n").is_empty());
        assert!(decoder.is_done());
    }

    #[test]
    fn sse_decoder_anthropic_events() {
        let mut decoder = SseDecoder::new(AnthropicProvider::extract_stream_event);
        let chunks = decoder.push(
            b"event: content_block_delta\n\
              data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\
              event: message_stop\n\
              data: {\"type\":\"message_stop\"}\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), "Hi");

        let err = decoder.push(b"data: {\"type\":\"error\",\"error\":{\"message\":\"overloaded\"}}\n");
        assert!(matches!(&err[0], Err(LlmError::ApiError { message, .. }) if message == "overloaded"));
    }

    #[test]
    fn sse_decoder_flushes_unterminated_tail() {
        let mut decoder = SseDecoder::new(OpenAiProvider::extract_stream_event);
        assert!(decoder
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")
            .is_empty());
        let rest = decoder.finish();
        assert_eq!(rest[0].as_ref().unwrap(), "tail");
    }

    #[test]
    fn local_provider_drops_placeholder_key() {
        let p = OpenAiProvider::local("http://localhost:8080", Some("none".into()));
        assert!(p.api_key.is_none());
        let p = OpenAiProvider::local("http://localhost:8080", Some("sk-1".into()));
        assert_eq!(p.api_key.as_deref(), Some("sk-1"));
    }

    #[test]
    fn llm_error_display() {
        let e = LlmError::ApiError {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(e.to_string(), "API error (status 500): boom");
        assert!(LlmError::MissingApiKey("KEY".into())
            .to_string()
            .contains("KEY"));
    }
}
