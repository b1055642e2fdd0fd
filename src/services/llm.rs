use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, utoipa::ToSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object reply.
    pub json_mode: bool,
    pub timeout: Duration,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.1,
            max_tokens: None,
            json_mode: false,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Display)]
pub enum LlmError {
    #[display(fmt = "LLM API key not configured")]
    NotConfigured,
    #[display(fmt = "LLM API returned {}: {}", status, body)]
    Status { status: u16, body: String },
    #[display(fmt = "LLM transport error: {}", message)]
    Transport { message: String, retryable: bool },
    #[display(fmt = "Malformed LLM reply: {}", _0)]
    Malformed(String),
}

impl std::error::Error for LlmError {}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            LlmError::Transport { retryable, .. } => *retryable,
            LlmError::NotConfigured | LlmError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Transport {
            retryable: e.is_timeout() || e.is_connect(),
            message: e.to_string(),
        }
    }
}

/// A chat-completions backend. Callers treat every error as "use the fallback".
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `attempt` (0-based), capped and with ±10% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            1.0 + rand::thread_rng().gen_range(-0.1..=0.1)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or retries run out.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(error = %e, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retrying LLM call");
                actix_web::rt::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Serialize)]
struct GroqRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct GroqResponse {
    choices: Vec<GroqChoice>,
}

#[derive(Deserialize)]
struct GroqChoice {
    message: GroqReplyMessage,
}

#[derive(Deserialize)]
struct GroqReplyMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client (Groq by default).
#[derive(Clone)]
pub struct GroqClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl GroqClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, LlmError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key,
            model: model.into(),
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        Self::new(
            config.llm_api_url.clone(),
            config.groq_api_key.clone(),
            config.llm_model.clone(),
            RetryPolicy::default().with_max_retries(config.llm_max_retries),
        )?
        .with_client_timeout(Duration::from_secs(config.llm_timeout_secs))
    }

    /// Hard cap for any single HTTP call, whatever the request asks for.
    pub fn with_client_timeout(mut self, timeout: Duration) -> Result<Self, LlmError> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    async fn send_once(&self, api_key: &str, request: &ChatRequest) -> Result<String, LlmError> {
        let body = GroqRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GroqResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::Malformed("empty choices".to_string()))
    }
}

#[async_trait]
impl ChatCompletion for GroqClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::NotConfigured)?;
        debug!(model = %self.model, messages = request.messages.len(), json = request.json_mode, "Sending chat completion");
        with_backoff(&self.retry, || self.send_once(api_key, &request)).await
    }
}

/// Pulls a JSON object out of a model reply, tolerating code fences and chatter.
pub fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned replies in order, then fails with `NotConfigured`.
    #[derive(Default)]
    pub struct ScriptedLlm {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        pub seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl ChatCompletion for ScriptedLlm {
        async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(LlmError::NotConfigured))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn retryable_classification() {
        let status = |status| LlmError::Status {
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!LlmError::NotConfigured.is_retryable());
        assert!(!LlmError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(6), Duration::from_secs(4));

        let jittered = RetryPolicy::default().delay_for(1);
        assert!(jittered >= Duration::from_millis(450) && jittered <= Duration::from_millis(550));
    }

    #[actix_web::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_retry(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::Status {
                        status: 503,
                        body: "busy".into(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[actix_web::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_retry(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::Status {
                    status: 401,
                    body: "bad key".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn missing_key_short_circuits() {
        let client = GroqClient::new("http://127.0.0.1:9/x", None, "m", fast_retry(0)).unwrap();
        let err = client
            .complete(ChatRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured));
    }

    #[actix_web::test]
    async fn sends_bearer_json_request_and_reads_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "llama-3.1-8b-instant",
                "response_format": {"type": "json_object"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"{\"intent\":\"GENERAL\"}"}}]}"#)
            .create_async()
            .await;

        let client = GroqClient::new(
            format!("{}/chat/completions", server.url()),
            Some("test-key".to_string()),
            "llama-3.1-8b-instant",
            fast_retry(0),
        )
        .unwrap();

        let reply = client
            .complete(ChatRequest::new(vec![ChatMessage::user("hello")]).json())
            .await
            .unwrap();
        assert_eq!(reply, r#"{"intent":"GENERAL"}"#);
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn server_errors_are_retried_then_surface() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("upstream down")
            .expect(3)
            .create_async()
            .await;

        let client = GroqClient::new(
            format!("{}/chat/completions", server.url()),
            Some("k".to_string()),
            "m",
            fast_retry(2),
        )
        .unwrap();

        let err = client
            .complete(ChatRequest::new(vec![ChatMessage::user("hello")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 500, .. }));
        mock.assert_async().await;
    }

    #[test]
    fn json_is_found_inside_fences_and_prose() {
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```").unwrap()["a"],
            1
        );
        assert_eq!(
            extract_json("Sure! {\"intent\": \"GENERAL\"} hope that helps").unwrap()["intent"],
            "GENERAL"
        );
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("[1,2]").is_none());
    }
}
