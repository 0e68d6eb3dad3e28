//! Client side of the external reasoning service.
//!
//! Analysis steps talk to a language model through [`ReasoningClient`].
//! The shipped implementation targets a local Ollama instance; tests use
//! [`MockReasoningClient`].

pub mod ollama;
pub mod sanitize;

pub use ollama::OllamaReasoningClient;
pub use sanitize::{extract_json, sanitize_model_output};

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReasoningError {
    #[error("Reasoning service not reachable at {0}")]
    Connection(String),

    #[error("Reasoning request timed out after {0}s")]
    Timeout(u64),

    #[error("Reasoning service rate limited the request")]
    RateLimited,

    #[error("Reasoning service error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Reasoning service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Reasoning service returned an empty response")]
    EmptyResponse,

    #[error("Model output is not valid JSON: {0}")]
    MalformedOutput(String),
}

impl ReasoningError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::Timeout(_)
            | Self::RateLimited
            | Self::Upstream { .. }
            | Self::HttpClient(_)
            | Self::EmptyResponse
            | Self::MalformedOutput(_) => true,
            Self::Rejected { .. } => false,
        }
    }
}

/// One completion request: system instructions plus the user prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
}

impl ReasoningRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.3,
        }
    }
}

/// Async completion client for the reasoning service.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Send one request and return the raw model text.
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ReasoningError>;

    /// Model identifier, recorded in logs.
    fn model_name(&self) -> &str;
}

/// Scripted client: replays queued responses in order, then repeats the fallback.
pub struct MockReasoningClient {
    queue: Mutex<VecDeque<Result<String, ReasoningError>>>,
    fallback: Result<String, ReasoningError>,
    requests: Mutex<Vec<ReasoningRequest>>,
}

impl MockReasoningClient {
    /// Always answers with `response`.
    pub fn new(response: &str) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Ok(response.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fails with `error`.
    pub fn failing(error: ReasoningError) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Err(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot answer served before the fallback.
    pub fn then(self, response: Result<String, ReasoningError>) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(response);
        }
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningClient for MockReasoningClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ReasoningError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        queued.unwrap_or_else(|| self.fallback.clone())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
