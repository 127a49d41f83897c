//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::ai::AiService;
use crate::error::AiError;

/// HTTP client for any chat-completions endpoint that speaks the OpenAI
/// protocol. The base URL may be a bare host, a `/v1` prefix, or the full
/// completions path — all three are accepted.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: SecretString,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::RequestFailed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            client,
        })
    }

    /// Resolve the completions URL from whatever shape of base URL was
    /// configured.
    fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

#[async_trait]
impl AiService for OpenAiCompatClient {
    async fn complete(&self, system_prompt: &str, text: &str) -> Result<String, AiError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": text },
            ],
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;

        let completion = extract_completion(&payload)?;
        debug!(model = %self.model, chars = completion.chars().count(), "Completion received");
        Ok(completion)
    }
}

/// Pull the first choice's message content out of a chat-completions
/// response body.
fn extract_completion(payload: &serde_json::Value) -> Result<String, AiError> {
    let content = payload
        .get("choices")
        .and_then(serde_json::Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            AiError::InvalidResponse("missing choices[0].message.content".to_string())
        })?;

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(AiError::EmptyCompletion);
    }
    Ok(trimmed.to_string())
}
