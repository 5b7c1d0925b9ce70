//! Client for the Gemini generative-language REST API.
//!
//! Two endpoints are used: `GET /models` to verify an API key (and learn
//! which models it can use), and `POST /models/{model}:generateContent` for
//! one chat turn. Every call runs under a hard deadline; on expiry the
//! in-flight request future is dropped, which aborts the underlying HTTP
//! call, so a late reply can never be observed.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use shared::chat::Message;
use shared::error::ChatError;

pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Hard per-request deadline, measured from send.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_ERROR_BODY_CHARS: usize = 800;

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_API_BASE_URL.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Point the client at a different API root (used by tests to hit a
    /// local mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lists the models available to this API key.
    ///
    /// Success doubles as key verification; any authorization or transport
    /// failure maps to [`ChatError::Provider`].
    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        self.with_deadline(async {
            let resp = self.http.get(&url).send().await.map_err(transport_error)?;
            if !resp.status().is_success() {
                return Err(provider_failure(resp).await);
            }
            let listing: ModelListing = resp
                .json()
                .await
                .map_err(|e| ChatError::MalformedResponse(e.to_string()))?;
            Ok(listing.models.into_iter().map(|m| m.name).collect())
        })
        .await
    }

    /// Sends one chat turn and returns the reply text.
    ///
    /// The payload carries the system prompt as the leading `user` turn,
    /// then the prior history in stored order, then `user_text`.
    pub async fn generate(
        &self,
        system_prompt: &str,
        history: &[Message],
        user_text: &str,
    ) -> Result<String, ChatError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let request = build_request(system_prompt, history, user_text);
        tracing::debug!(model = %self.model, turns = request.contents.len(), "sending generate request");
        self.with_deadline(async {
            let resp = self
                .http
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(transport_error)?;
            if !resp.status().is_success() {
                return Err(provider_failure(resp).await);
            }
            let body: GeminiResponse = resp
                .json()
                .await
                .map_err(|e| ChatError::MalformedResponse(e.to_string()))?;
            extract_text(body)
        })
        .await
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ChatError>>,
    ) -> Result<T, ChatError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "request deadline expired, call aborted");
                Err(ChatError::Timeout)
            }
        }
    }
}

fn build_request(system_prompt: &str, history: &[Message], user_text: &str) -> GeminiRequest {
    let mut contents = Vec::with_capacity(history.len() + 2);
    if !system_prompt.trim().is_empty() {
        contents.push(turn("user", system_prompt));
    }
    for msg in history {
        contents.push(turn(msg.role.as_provider_role(), &msg.content));
    }
    contents.push(turn("user", user_text));
    GeminiRequest { contents }
}

fn turn(role: &str, text: &str) -> GeminiContent {
    GeminiContent {
        role: role.to_string(),
        parts: vec![GeminiPart {
            text: text.to_string(),
        }],
    }
}

fn extract_text(body: GeminiResponse) -> Result<String, ChatError> {
    body.candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .ok_or_else(|| ChatError::MalformedResponse("no candidate text in response".to_string()))
}

fn transport_error(err: reqwest::Error) -> ChatError {
    ChatError::Provider {
        status: None,
        message: err.to_string(),
    }
}

async fn provider_failure(resp: reqwest::Response) -> ChatError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim();
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else if body.chars().count() > MAX_ERROR_BODY_CHARS {
        let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    };
    ChatError::Provider {
        status: Some(status),
        message,
    }
}
