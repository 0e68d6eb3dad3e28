use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ReasoningClient, ReasoningError, ReasoningRequest};

/// Ollama HTTP client for the reasoning service.
pub struct OllamaReasoningClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OllamaReasoningClient {
    /// Create a client pointing at an Ollama instance.
    ///
    /// `timeout` bounds a single HTTP exchange; the step executor applies its
    /// own per-step timeout on top.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ReasoningError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReasoningError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs: timeout.as_secs(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> ReasoningError {
        if e.is_connect() {
            ReasoningError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            ReasoningError::Timeout(self.timeout_secs)
        } else {
            ReasoningError::HttpClient(e.to_string())
        }
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: &'a str,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn classify_status(status: u16, body: String) -> ReasoningError {
    match status {
        429 => ReasoningError::RateLimited,
        500..=599 => ReasoningError::Upstream { status, body },
        _ => ReasoningError::Rejected { status, body },
    }
}

#[async_trait]
impl ReasoningClient for OllamaReasoningClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ReasoningError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            system: &request.system,
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::MalformedOutput(e.to_string()))?;

        if parsed.response.trim().is_empty() {
            return Err(ReasoningError::EmptyResponse);
        }
        Ok(parsed.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_trimmed() {
        let client =
            OllamaReasoningClient::new("http://localhost:11434/", "medgemma", Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(client.model_name(), "medgemma");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429, String::new()), ReasoningError::RateLimited);
        assert!(matches!(
            classify_status(503, "busy".into()),
            ReasoningError::Upstream { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(404, "model not found".into()),
            ReasoningError::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn request_body_shape() {
        let body = OllamaGenerateRequest {
            model: "m",
            prompt: "p",
            system: "s",
            stream: false,
            format: "json",
            options: OllamaOptions { temperature: 0.5 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["format"], "json");
        assert_eq!(json["options"]["temperature"], 0.5);
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let client =
            OllamaReasoningClient::new("http://127.0.0.1:1", "m", Duration::from_secs(2)).unwrap();
        let err = client
            .complete(&ReasoningRequest::new("s", "p"))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
