//! Language-model collaborator.
//!
//! The model is untrusted: it may be unreachable, rate limited, slow, or
//! return text that only resembles the requested structure. Transport
//! failures are `ModelError`s; malformed text is a successful response that
//! the callers repair.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Model call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl ModelError {
    /// Every transport failure is worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        true
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub system: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.1,
            max_output_tokens: 2000,
        }
    }
}

/// Abstraction over the language model for testability.
pub trait ModelClient: Send + Sync {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ModelError>;
}

/// Counting permit over upstream model calls. A permit is released when the
/// upstream call returns, not when the caller stops waiting for it, so calls
/// abandoned on timeout still count against the limit.
#[derive(Debug, Clone)]
pub struct CallPermits {
    state: Arc<(Mutex<usize>, Condvar)>,
    limit: usize,
}

impl CallPermits {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new((Mutex::new(0), Condvar::new())),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Upstream calls currently running, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        *self.state.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_until(&self, deadline: Instant) -> Option<CallPermit> {
        let (count, freed) = &*self.state;
        let mut held = count.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *held < self.limit {
                *held += 1;
                return Some(CallPermit {
                    state: Arc::clone(&self.state),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            held = freed
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct CallPermit {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let (count, freed) = &*self.state;
        let mut held = count.lock().unwrap_or_else(PoisonError::into_inner);
        *held = held.saturating_sub(1);
        freed.notify_one();
    }
}

/// Run one completion on a helper thread and give up after `timeout`.
///
/// Waiting for a free permit counts against the same deadline. A timed-out
/// call keeps running in the background and keeps its permit until it
/// returns; its result is dropped.
pub fn complete_with_timeout(
    client: &Arc<dyn ModelClient>,
    prompt: &str,
    options: &CompletionOptions,
    timeout: Duration,
    permits: &CallPermits,
) -> Result<String, ModelError> {
    let deadline = Instant::now() + timeout;
    let Some(permit) = permits.acquire_until(deadline) else {
        tracing::debug!(in_flight = permits.in_flight(), limit = permits.limit(), "No model call slot before deadline");
        return Err(ModelError::Timeout(timeout));
    };

    let (tx, rx) = mpsc::channel();
    let client = Arc::clone(client);
    let prompt = prompt.to_string();
    let options = options.clone();
    std::thread::spawn(move || {
        let result = client.complete(&prompt, &options);
        drop(permit);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ModelError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ModelError::ModelUnavailable(
            "model call thread ended without a result".into(),
        )),
    }
}

// ═══════════════════════════════════════════════════════════
// Ollama-compatible HTTP client
// ═══════════════════════════════════════════════════════════

pub struct OllamaModelClient {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl OllamaModelClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::ModelUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout,
        })
    }

    /// Endpoint and model from `ASSESSMAP_MODEL_URL` / `ASSESSMAP_MODEL`.
    pub fn from_env(timeout: Duration) -> Result<Self, ModelError> {
        Self::new(&crate::config::model_base_url(), &crate::config::model_name(), timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl ModelClient for OllamaModelClient {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system: options.system.as_deref(),
            stream: false,
            options: GenerateOptions {
                temperature: options.temperature,
                num_predict: options.max_output_tokens,
            },
        };

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(self.timeout)
            } else if e.is_connect() {
                ModelError::ModelUnavailable(format!("cannot connect to {}", self.base_url))
            } else {
                ModelError::ModelUnavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ModelError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::ModelUnavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        // An unreadable envelope is a transport problem, not malformed model text.
        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| ModelError::ModelUnavailable(format!("unreadable response envelope: {e}")))?;
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient(Duration);

    impl ModelClient for SlowClient {
        fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String, ModelError> {
            std::thread::sleep(self.0);
            Ok("{}".into())
        }
    }

    struct EchoClient;

    impl ModelClient for EchoClient {
        fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String, ModelError> {
            Ok(prompt.to_uppercase())
        }
    }

    #[test]
    fn traits_are_object_safe() {
        let _client: Arc<dyn ModelClient> = Arc::new(EchoClient);
    }

    #[test]
    fn timeout_returns_timeout_error() {
        let client: Arc<dyn ModelClient> = Arc::new(SlowClient(Duration::from_millis(300)));
        let permits = CallPermits::new(1);
        let err = complete_with_timeout(&client, "p", &CompletionOptions::default(), Duration::from_millis(20), &permits)
            .unwrap_err();
        assert_eq!(err, ModelError::Timeout(Duration::from_millis(20)));
        assert!(err.is_retryable());
    }

    #[test]
    fn fast_call_returns_result() {
        let client: Arc<dyn ModelClient> = Arc::new(EchoClient);
        let permits = CallPermits::new(1);
        let out = complete_with_timeout(&client, "map", &CompletionOptions::default(), Duration::from_secs(2), &permits)
            .unwrap();
        assert_eq!(out, "MAP");
        assert_eq!(permits.in_flight(), 0);
    }

    #[test]
    fn abandoned_call_keeps_its_slot() {
        let client: Arc<dyn ModelClient> = Arc::new(SlowClient(Duration::from_millis(200)));
        let permits = CallPermits::new(1);
        let options = CompletionOptions::default();

        let first = complete_with_timeout(&client, "a", &options, Duration::from_millis(20), &permits).unwrap_err();
        assert!(matches!(first, ModelError::Timeout(_)));
        assert_eq!(permits.in_flight(), 1);

        // The slot is still taken by the abandoned call, so this one never starts.
        let second = complete_with_timeout(&client, "b", &options, Duration::from_millis(20), &permits).unwrap_err();
        assert!(matches!(second, ModelError::Timeout(_)));
        assert_eq!(permits.in_flight(), 1);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(permits.in_flight(), 0);
        let echo: Arc<dyn ModelClient> = Arc::new(EchoClient);
        assert_eq!(
            complete_with_timeout(&echo, "c", &options, Duration::from_secs(2), &permits).unwrap(),
            "C"
        );
    }

    #[test]
    fn zero_limit_still_admits_one_call() {
        assert_eq!(CallPermits::new(0).limit(), 1);
    }

    #[test]
    fn rate_limit_carries_delay() {
        let err = ModelError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.to_string(), "Model rate limited");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ModelError::Timeout(Duration::from_secs(3)).retry_after(), None);
    }

    #[test]
    fn unreachable_endpoint_is_unavailable() {
        let client = OllamaModelClient::new("http://127.0.0.1:9", "m", Duration::from_millis(300)).unwrap();
        let err = client.complete("hi", &CompletionOptions::default()).unwrap_err();
        assert!(matches!(err, ModelError::ModelUnavailable(_) | ModelError::Timeout(_)));
    }

    #[test]
    fn from_env_uses_configured_model() {
        let client = OllamaModelClient::from_env(Duration::from_secs(1)).unwrap();
        assert_eq!(client.model(), crate::config::model_name());
    }

    #[test]
    fn request_serializes_ollama_shape() {
        let body = GenerateRequest {
            model: "m",
            prompt: "p",
            system: None,
            stream: false,
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: 10,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["options"]["num_predict"], 10);
    }
}
