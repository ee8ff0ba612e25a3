use async_trait::async_trait;
use colloquy_core::{
    ChatMessage, Completion, CompletionBackend, GenerationProgress, TransportError, Usage,
};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::sse::consume_stream;

const COMPLETIONS_PATH: &str = "/v1/chat/completions";
const TOKENS_PATH: &str = "/v1/chat/tokens";

/// Settings for one remote completion endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Whole-request limit for single-shot calls.
    pub request_timeout: Duration,
    /// Limit on receiving response headers for a streaming call.
    pub stream_connect_timeout: Duration,
    /// Longest tolerated silence between stream reads.
    pub stall_timeout: Duration,
    pub rate_limit_per_second: usize,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: String::new(),
            model: None,
            max_tokens: None,
            temperature: None,
            request_timeout: Duration::from_secs(30),
            stream_connect_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
            rate_limit_per_second: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }
}

/// Point-in-time copy of the transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests: u64,
    pub retries: u64,
    pub dropped_chunks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    dropped_chunks: AtomicU64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct TokenCountRequest<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
    #[serde(default, rename = "finishReason", alias = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenCountResponse {
    #[serde(rename = "totalTokens", alias = "total_tokens")]
    total_tokens: u64,
}

/// Rate-limited, retrying HTTP client for an OpenAI-style completion API.
pub struct HttpTransport {
    client: Client,
    config: TransportConfig,
    limiter: RateLimiter,
    counters: Counters,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        info!("Creating HttpTransport for {}", config.base_url);
        let client = Client::builder()
            .connect_timeout(config.stream_connect_timeout.min(config.request_timeout))
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            limiter: RateLimiter::per_second(config.rate_limit_per_second),
            config,
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dropped_chunks: self.counters.dropped_chunks.load(Ordering::Relaxed),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn completion_request<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        stream: bool,
    ) -> CompletionRequest<'a> {
        CompletionRequest {
            model: self.config.model.as_deref(),
            messages,
            stream,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Sends one POST through the rate limiter and maps transport-level
    /// failures. Non-2xx responses become `Upstream` errors.
    async fn post<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> Result<Response, TransportError> {
        self.limiter.acquire().await;
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut request = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to read body of {status} response from {path}: {e}");
                    String::new()
                }
            };
            return Err(TransportError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn map_send_error(&self, e: &reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.config.request_timeout)
        } else {
            TransportError::Network(e.to_string())
        }
    }

    /// Runs `post` under the retry policy and records how many retries it took.
    async fn post_with_retry<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> Result<Response, TransportError> {
        let retried = retry_with_backoff(
            || self.post(path, body, timeout),
            &self.config.retry,
            TransportError::is_retryable,
        )
        .await?;
        self.counters
            .retries
            .fetch_add(u64::from(retried.retries), Ordering::Relaxed);
        Ok(retried.value)
    }

    /// Opens the streaming response. Only this step is retried: once the body
    /// starts flowing a failure is final.
    async fn open_stream(&self, messages: &[ChatMessage]) -> Result<Response, TransportError> {
        let request = self.completion_request(messages, true);
        let connect = self.post_with_retry(COMPLETIONS_PATH, &request, None);
        tokio::time::timeout(self.config.stream_connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout(self.config.stream_connect_timeout))?
    }
}

#[async_trait]
impl CompletionBackend for HttpTransport {
    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, TransportError> {
        debug!("Sending completion request with {} messages", messages.len());
        let request = self.completion_request(messages, false);
        let response = self
            .post_with_retry(COMPLETIONS_PATH, &request, Some(self.config.request_timeout))
            .await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::InvalidResponse("no choices returned".to_string()))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                "Tokens: {} prompt + {} completion = {} total",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        Ok(Completion {
            id: parsed.id,
            text: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: parsed.usage,
        })
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        on_progress: &mut (dyn FnMut(GenerationProgress) + Send),
    ) -> Result<String, TransportError> {
        debug!("Opening completion stream with {} messages", messages.len());
        let response = self.open_stream(messages).await?;

        let outcome = consume_stream(
            Box::pin(response.bytes_stream()),
            self.config.stall_timeout,
            on_progress,
        )
        .await?;
        if outcome.dropped_chunks > 0 {
            self.counters
                .dropped_chunks
                .fetch_add(outcome.dropped_chunks, Ordering::Relaxed);
        }

        info!(
            "Stream {} finished with {} chars",
            outcome.message_id,
            outcome.text.len()
        );
        Ok(outcome.text)
    }

    async fn count_tokens(&self, messages: &[ChatMessage]) -> Result<u64, TransportError> {
        let request = TokenCountRequest { messages };
        let response = self
            .post_with_retry(TOKENS_PATH, &request, Some(self.config.request_timeout))
            .await?;
        let parsed: TokenCountResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        Ok(parsed.total_tokens)
    }
}
