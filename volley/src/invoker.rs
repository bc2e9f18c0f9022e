//! Call invocation against the remote generation API.
//!
//! The [`CallInvoker`] trait abstracts a single request so the dispatcher can be
//! exercised without network traffic. [`OpenAiInvoker`] talks to an
//! OpenAI-compatible `/chat/completions` endpoint over an injected
//! `reqwest::Client`; [`MockInvoker`] answers from a script and records what it
//! was asked.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::classify::CallFailure;
use crate::types::{CallId, ModelParams};

/// Everything an invoker needs for one call.
#[derive(Debug, Clone, Copy)]
pub struct CallRequest<'a> {
    /// Issuance position of this call; used for tracing only
    pub call_id: CallId,
    pub model: &'a ModelParams,
    pub prompt: &'a str,
}

/// A call record without its call id, as produced by an invoker.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Wall-clock time spent on the network exchange
    pub response_time: Duration,
    /// Tokens the remote service attributed to the call; zero when not reported
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Generated text, or the unclassified failure
    pub outcome: Result<String, CallFailure>,
}

impl Invocation {
    pub fn succeeded(response_time: Duration, input_tokens: u64, output_tokens: u64, text: String) -> Self {
        Self {
            response_time,
            input_tokens,
            output_tokens,
            outcome: Ok(text),
        }
    }

    pub fn failed(response_time: Duration, failure: CallFailure) -> Self {
        Self {
            response_time,
            input_tokens: 0,
            output_tokens: 0,
            outcome: Err(failure),
        }
    }
}

/// Issues one request to the remote generation API.
///
/// Implementations must not retry and must not panic on remote failures;
/// every failure is reported through [`Invocation::outcome`].
///
/// # Example
/// ```ignore
/// let invoker = OpenAiInvoker::new(reqwest::Client::new(), endpoint, Some(api_key), Duration::from_secs(60));
/// let invocation = invoker.invoke(&CallRequest { call_id: 1, model: &params, prompt: "Hello" }).await;
/// ```
#[async_trait]
pub trait CallInvoker: Send + Sync {
    async fn invoke(&self, request: &CallRequest<'_>) -> Invocation;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Invoker for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct OpenAiInvoker {
    client: reqwest::Client,
    completions_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ProviderError>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl OpenAiInvoker {
    /// Create an invoker on top of a caller-owned client handle.
    ///
    /// `endpoint` is the API base, e.g. `https://api.example.com/v1`; the
    /// `/chat/completions` path is appended.
    pub fn new(client: reqwest::Client, endpoint: &Url, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            completions_url: format!("{}/chat/completions", endpoint.as_str().trim_end_matches('/')),
            api_key: api_key.filter(|key| !key.is_empty()),
            timeout,
        }
    }

    fn failure_from_status(status: u16, body: &str) -> (CallFailure, Usage) {
        let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let (code, message, usage) = match envelope {
            Some(envelope) => {
                let usage = envelope.usage.unwrap_or_default();
                match envelope.error {
                    Some(error) => {
                        let code = match error.code {
                            Some(serde_json::Value::String(code)) => Some(code),
                            Some(serde_json::Value::Number(code)) => Some(code.to_string()),
                            _ => None,
                        }
                        .or(error.kind);
                        (code, error.message.or(envelope.message), usage)
                    }
                    None => (None, envelope.message, usage),
                }
            }
            None => (None, None, Usage::default()),
        };

        let message = message.unwrap_or_else(|| truncate(body, 200).to_string());
        (CallFailure::Status { status, code, message }, usage)
    }
}

impl From<reqwest::Error> for CallFailure {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            CallFailure::Timeout { message }
        } else if err.is_decode() {
            CallFailure::Decode { message }
        } else {
            CallFailure::Transport { message }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[async_trait]
impl CallInvoker for OpenAiInvoker {
    #[tracing::instrument(skip(self, request), fields(call_id = request.call_id, model = %request.model.name))]
    async fn invoke(&self, request: &CallRequest<'_>) -> Invocation {
        let payload = ChatRequest {
            model: &request.model.model_id,
            messages: [ChatMessage {
                role: "user",
                content: request.prompt,
            }],
            max_tokens: request.model.max_tokens,
            temperature: request.model.temperature,
            top_p: request.model.top_p,
        };

        let mut builder = self.client.post(&self.completions_url).timeout(self.timeout).json(&payload);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %self.completions_url, error = %e, "Request failed before a response");
                return Invocation::failed(start.elapsed(), e.into());
            }
        };
        let status = response.status();
        let body = response.text().await;
        let response_time = start.elapsed();

        let body = match body {
            Ok(body) => body,
            Err(e) => return Invocation::failed(response_time, e.into()),
        };

        if !status.is_success() {
            let (failure, usage) = Self::failure_from_status(status.as_u16(), &body);
            tracing::debug!(status = status.as_u16(), error = %failure, "Remote service returned an error");
            return Invocation {
                response_time,
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                outcome: Err(failure),
            };
        }

        match serde_json::from_str::<ChatCompletion>(&body) {
            Ok(completion) => {
                let usage = completion.usage.unwrap_or_default();
                let text = completion
                    .choices
                    .into_iter()
                    .filter_map(|choice| choice.message.and_then(|message| message.content))
                    .collect::<String>();
                Invocation::succeeded(response_time, usage.prompt_tokens, usage.completion_tokens, text)
            }
            Err(e) => Invocation::failed(
                response_time,
                CallFailure::Decode {
                    message: format!("{e}; body: {}", truncate(&body, 200)),
                },
            ),
        }
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Scripted answer of a [`MockInvoker`].
#[derive(Debug, Clone)]
pub enum MockResponse {
    Success {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Failure {
        failure: CallFailure,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Panic inside `invoke`
    Panic(String),
    /// Never answer
    Hang,
}

impl MockResponse {
    pub fn success(text: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        MockResponse::Success {
            text: text.into(),
            input_tokens,
            output_tokens,
        }
    }

    pub fn failure(failure: CallFailure) -> Self {
        MockResponse::Failure {
            failure,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

type LatencyFn = Arc<dyn Fn(CallId) -> Duration + Send + Sync>;

/// Invoker that answers from a script instead of the network.
///
/// Responses are keyed by call id with a fallback for unscripted calls. The
/// mock tracks how many calls are in flight so tests can check concurrency
/// ceilings.
///
/// # Example
/// ```ignore
/// let mock = MockInvoker::new(MockResponse::success("ok", 10, 20))
///     .respond_to(2, MockResponse::failure(CallFailure::Timeout { message: "slow".into() }))
///     .with_latency(|call_id| Duration::from_millis(10 * call_id as u64));
/// ```
#[derive(Clone)]
pub struct MockInvoker {
    default: MockResponse,
    scripted: Arc<Mutex<HashMap<CallId, MockResponse>>>,
    latency: LatencyFn,
    calls: Arc<Mutex<Vec<CallId>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockInvoker {
    pub fn new(default: MockResponse) -> Self {
        Self {
            default,
            scripted: Arc::new(Mutex::new(HashMap::new())),
            latency: Arc::new(|_| Duration::ZERO),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer `call_id` with `response` instead of the default.
    pub fn respond_to(self, call_id: CallId, response: MockResponse) -> Self {
        self.scripted.lock().insert(call_id, response);
        self
    }

    /// Simulated network latency per call.
    pub fn with_latency(mut self, latency: impl Fn(CallId) -> Duration + Send + Sync + 'static) -> Self {
        self.latency = Arc::new(latency);
        self
    }

    /// Call ids in the order `invoke` was entered.
    pub fn calls(&self) -> Vec<CallId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of simultaneously running `invoke` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallInvoker for MockInvoker {
    async fn invoke(&self, request: &CallRequest<'_>) -> Invocation {
        self.calls.lock().push(request.call_id);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let response = self
            .scripted
            .lock()
            .get(&request.call_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        let start = Instant::now();
        tokio::time::sleep((self.latency)(request.call_id)).await;

        match response {
            MockResponse::Success {
                text,
                input_tokens,
                output_tokens,
            } => Invocation::succeeded(start.elapsed(), input_tokens, output_tokens, text),
            MockResponse::Failure {
                failure,
                input_tokens,
                output_tokens,
            } => Invocation {
                response_time: start.elapsed(),
                input_tokens,
                output_tokens,
                outcome: Err(failure),
            },
            MockResponse::Panic(message) => panic!("{message}"),
            MockResponse::Hang => std::future::pending::<Invocation>().await,
        }
    }
}
