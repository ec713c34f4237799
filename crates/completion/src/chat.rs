//! HTTP completion capability for OpenAI-compatible chat endpoints
//!
//! One `complete` call is one request: no retries, no credential selection.
//! Both live in the layers above; this client only turns a prompt and a key
//! into text or a `CompletionError`.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{CompletionError, Result};

/// Longest upstream error body kept in a `CompletionError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Minimal chat-completions response shape.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

/// Client for a single chat-completions endpoint and model.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl ChatClient {
    /// Build a client with the given per-request timeout.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Http(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one user prompt and return the first choice's text.
    ///
    /// A response with no choices or no content yields an empty string, which
    /// the invoker treats as an unacceptable result rather than an error.
    #[instrument(skip_all, fields(model = %self.model, key = %api_key.hint()))]
    pub async fn complete(&self, api_key: &Secret<String>, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            truncate_at_char_boundary(&mut text, MAX_ERROR_BODY);
            debug!(status = status.as_u16(), "completion request rejected");
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Decode(e.to_string()))?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default())
    }
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
