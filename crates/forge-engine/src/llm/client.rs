use super::models::{ModelFamily, Usage};
use forge_adapters::config::{Config, RetrySettings};
use forge_adapters::util::truncate_str;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum length for remote content quoted in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Everything one completion call needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub token_limit: u32,
    /// Dropped for model families that reject it.
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn family(&self) -> ModelFamily {
        ModelFamily::from_id(&self.model)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn total_tokens(&self) -> u32 {
        self.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0)
    }

    pub fn was_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no API key configured; set FORGE_API_KEY or OPENROUTER_API_KEY")]
    MissingApiKey,
    #[error("completion service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// Error object delivered with a 200 status by an upstream provider.
    #[error("provider error: {message}")]
    Provider { code: Option<i32>, message: String },
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not connect to completion service: {0}")]
    Connection(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response from completion service: {0}")]
    InvalidResponse(String),
    #[error("request was refused: {0}")]
    Refused(String),
    #[error("completion service returned empty output ({reasoning_tokens} reasoning tokens used)")]
    EmptyCompletion {
        reasoning_tokens: u32,
        usage: Option<Usage>,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<CompletionError>,
    },
}

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

impl CompletionError {
    /// Transient faults that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Http { status, .. } => RETRYABLE_STATUS.contains(status),
            CompletionError::Provider { code, .. } => {
                code.map(|c| c >= 500 || c == 429).unwrap_or(true)
            }
            CompletionError::Timeout(_) | CompletionError::Connection(_) => true,
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error, attempt_timeout: Duration) -> Self {
        if err.is_timeout() {
            CompletionError::Timeout(attempt_timeout)
        } else if err.is_connect() || is_connection_reset(&err) {
            CompletionError::Connection(err.to_string())
        } else {
            CompletionError::Request(err.to_string())
        }
    }
}

fn is_connection_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    use std::io::ErrorKind;
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Bounded exponential backoff with a deadline on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay(),
            attempt_timeout: settings.attempt_timeout(),
        }
    }

    /// Delay after failed attempt `attempt` (zero-based): `base * 2^attempt`.
    pub fn delay_before_retry(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Drive `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out.
    ///
    /// Each attempt races a `tokio::time::timeout`; on expiry the attempt's
    /// future is dropped, which cancels the in-flight request.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, CompletionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CompletionError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CompletionError::Timeout(self.attempt_timeout)),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(attempt = attempt + 1, error = %err, "completion failed, not retrying");
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                warn!(attempts = max_attempts, error = %err, "completion retries exhausted");
                return Err(CompletionError::RetriesExhausted {
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_before_retry(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying completion request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CompletionResponse, CompletionError>> + Send + 'a>>;

/// Seam between the orchestrator and whatever produces completions.
pub trait CompletionService: Send + Sync {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a>;
}

#[derive(Serialize)]
pub(crate) struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl<'a> WireRequest<'a> {
    /// Pick the parameter names the model family accepts.
    pub(crate) fn new(request: &'a CompletionRequest) -> Self {
        let family = request.family();
        let (max_tokens, max_completion_tokens) = match family {
            ModelFamily::Standard => (Some(request.token_limit), None),
            ModelFamily::Reasoning => (None, Some(request.token_limit)),
        };
        Self {
            model: &request.model,
            messages: &request.messages,
            max_tokens,
            max_completion_tokens,
            temperature: request.temperature.filter(|_| family.supports_temperature()),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageContent {
    /// Null when the provider refuses or fails
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorEnvelope {
    error: ProviderApiError,
}

#[derive(Deserialize)]
struct ProviderApiError {
    message: String,
    #[serde(default)]
    code: Option<i32>,
}

/// Turn a 2xx body into a response, or the error it actually carries.
fn parse_success_body(text: &str) -> Result<CompletionResponse, CompletionError> {
    if let Ok(envelope) = serde_json::from_str::<ProviderErrorEnvelope>(text) {
        return Err(CompletionError::Provider {
            code: envelope.error.code,
            message: sanitize_api_response(&envelope.error.message),
        });
    }

    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| {
        CompletionError::InvalidResponse(format!("{}: {}", e, sanitize_api_response(text)))
    })?;

    let choice = parsed.choices.into_iter().next();
    if let Some(refusal) = choice.as_ref().and_then(|c| c.message.refusal.as_deref()) {
        return Err(CompletionError::Refused(
            truncate_str(refusal, MAX_ERROR_CONTENT_LEN).to_string(),
        ));
    }

    let (content, finish_reason) = match choice {
        Some(c) => (c.message.content.unwrap_or_default(), c.finish_reason),
        None => (String::new(), None),
    };

    if content.trim().is_empty() {
        return Err(CompletionError::EmptyCompletion {
            reasoning_tokens: parsed.usage.as_ref().map(Usage::reasoning_tokens).unwrap_or(0),
            usage: parsed.usage,
        });
    }

    Ok(CompletionResponse {
        text: content,
        finish_reason,
        usage: parsed.usage,
    })
}

/// HTTP client for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl CompletionClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        policy: RetryPolicy,
    ) -> Result<Self, CompletionError> {
        // No client-wide timeout: every attempt gets its own deadline in `RetryPolicy::run`.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CompletionError::Request(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            policy,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CompletionError> {
        Self::new(
            config.endpoint.clone(),
            config.api_key(),
            RetryPolicy::from_settings(&config.retry),
        )
    }

    async fn send_once(
        &self,
        body: &WireRequest<'_>,
        api_key: &str,
        attempt: u32,
    ) -> Result<CompletionResponse, CompletionError> {
        debug!(model = body.model, attempt = attempt + 1, "sending completion request");
        let timeout = self.policy.attempt_timeout;
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", "https://github.com/forge-dev/forge")
            .header("X-Title", "Forge")
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::from_reqwest(e, timeout))?;

        if !status.is_success() {
            let message = match status.as_u16() {
                401 => "invalid API key".to_string(),
                _ => sanitize_api_response(&text),
            };
            return Err(CompletionError::Http {
                status: status.as_u16(),
                message,
            });
        }

        parse_success_body(&text)
    }

    /// One logical completion: parameter adaptation plus the retry loop.
    pub async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(CompletionError::MissingApiKey)?;

        let body = WireRequest::new(request);
        let response = self
            .policy
            .run(|attempt| self.send_once(&body, api_key, attempt))
            .await?;

        debug!(
            model = %request.model,
            finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
            total_tokens = response.total_tokens(),
            "completion received"
        );
        Ok(response)
    }
}

impl CompletionService for CompletionClient {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(self.complete_with_retry(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            token_limit: 256,
            temperature: Some(0.3),
        }
    }

    fn policy(max_attempts: u32, base_ms: u64, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            attempt_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn http(status: u16) -> CompletionError {
        CompletionError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        for status in [429, 500, 502, 503, 504] {
            assert!(http(status).is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 501] {
            assert!(!http(status).is_retryable(), "{status}");
        }
        assert!(CompletionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CompletionError::Connection("reset".into()).is_retryable());
        assert!(!CompletionError::MissingApiKey.is_retryable());
        assert!(!CompletionError::EmptyCompletion {
            reasoning_tokens: 0,
            usage: None
        }
        .is_retryable());
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let p = policy(5, 500, 1_000);
        assert_eq!(p.delay_before_retry(0), Duration::from_millis(500));
        assert_eq!(p.delay_before_retry(1), Duration::from_millis(1_000));
        assert_eq!(p.delay_before_retry(3), Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_stop_at_first_success() {
        let p = policy(5, 100, 10_000);
        let mut calls = 0;
        let start = Instant::now();
        let result = p
            .run(|_| {
                calls += 1;
                let outcome = if calls < 3 { Err(http(503)) } else { Ok(calls) };
                async move { outcome }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
        // 100ms after the first failure, 200ms after the second.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_exhaust_attempts() {
        let p = policy(3, 50, 10_000);
        let mut calls = 0;
        let start = Instant::now();
        let result: Result<(), _> = p
            .run(|_| {
                calls += 1;
                async { Err(http(429)) }
            })
            .await;
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(150));
        match result {
            Err(CompletionError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, CompletionError::Http { status: 429, .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_surfaces_immediately() {
        let p = policy(4, 50, 10_000);
        let mut calls = 0;
        let start = Instant::now();
        let result: Result<(), _> = p
            .run(|_| {
                calls += 1;
                async { Err(http(401)) }
            })
            .await;
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(result, Err(CompletionError::Http { status: 401, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried_and_cancels_attempt() {
        let p = policy(2, 10, 1_000);
        let finished = Arc::new(AtomicU32::new(0));
        let mut calls = 0;
        let start = Instant::now();
        let result: Result<(), _> = p
            .run(|_| {
                calls += 1;
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(calls, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(2_010));
        match result {
            Err(CompletionError::RetriesExhausted { last, .. }) => {
                assert!(matches!(*last, CompletionError::Timeout(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        tokio::time::sleep(Duration::from_secs(7_200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wire_shape_for_standard_model() {
        let req = request("openai/gpt-4o-mini");
        let value = serde_json::to_value(WireRequest::new(&req)).unwrap();
        assert_eq!(value["max_tokens"], 256);
        assert!(value.get("max_completion_tokens").is_none());
        assert!((value["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(value["messages"][0]["role"], "system");
    }

    #[test]
    fn test_wire_shape_for_reasoning_model() {
        let req = request("openai/o3-mini");
        let value = serde_json::to_value(WireRequest::new(&req)).unwrap();
        assert_eq!(value["max_completion_tokens"], 256);
        assert!(value.get("max_tokens").is_none());
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        assert_eq!(sanitize_api_response("model not found"), "model not found");
        assert!(sanitize_api_response("Invalid api_key sk-abc").contains("redacted"));
        assert_eq!(
            sanitize_api_response(&"x".repeat(500)).chars().count(),
            MAX_ERROR_CONTENT_LEN
        );
    }

    #[test]
    fn test_success_body_with_embedded_provider_error() {
        let body = r#"{"error":{"message":"upstream overloaded","code":502}}"#;
        let err = parse_success_body(body).unwrap_err();
        assert!(matches!(err, CompletionError::Provider { code: Some(502), .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_refusal_is_reported() {
        let body = r#"{"choices":[{"message":{"content":null,"refusal":"no"}}]}"#;
        assert!(matches!(
            parse_success_body(body),
            Err(CompletionError::Refused(_))
        ));
    }

    fn client_for(server: &mockito::Server, key: Option<&str>) -> CompletionClient {
        CompletionClient::new(
            format!("{}/v1/chat/completions", server.url()),
            key.map(str::to_string),
            policy(3, 1, 5_000),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"content":"hello"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, Some("sk-test"));
        let response = client
            .complete(&request("openai/gpt-4o-mini"))
            .await
            .unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.total_tokens(), 6);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"No auth credentials found"}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, Some("sk-test"));
        let err = client
            .complete(&request("openai/gpt-4o-mini"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Http { status: 401, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retried_to_the_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server, Some("sk-test"));
        let err = client
            .complete(&request("openai/gpt-4o-mini"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CompletionError::RetriesExhausted { attempts: 3, .. }
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_output_reports_reasoning_tokens() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"content":""},"finish_reason":"length"}],
                    "usage":{"total_tokens":900,"completion_tokens_details":{"reasoning_tokens":880}}}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, Some("sk-test"));
        let err = client
            .complete(&request("openai/o3-mini"))
            .await
            .unwrap_err();
        match err {
            CompletionError::EmptyCompletion {
                reasoning_tokens,
                usage,
            } => {
                assert_eq!(reasoning_tokens, 880);
                assert_eq!(usage.map(|u| u.total_tokens), Some(900));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reasoning_model_request_body_shape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "openai/o3-mini",
                "max_completion_tokens": 256
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"ok"}}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, Some("sk-test"));
        client.complete(&request("openai/o3-mini")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_api_key_makes_no_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .expect(0)
            .create_async()
            .await;
        let client = client_for(&server, None);
        let err = client
            .complete(&request("openai/gpt-4o-mini"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::MissingApiKey));
        mock.assert_async().await;
    }
}
