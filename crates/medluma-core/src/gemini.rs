//! Gemini `generateContent` client.
//!
//! Carries an immutable [`RetryPolicy`]: bounded attempts with exponential
//! backoff, retried only on the configured transient HTTP statuses. Tool
//! execution (BioMCP, web search) is delegated to the serving side; this
//! client only forwards the rendered instruction.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::model::{ModelClient, ModelRequest};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiModelClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl GeminiModelClient {
    pub fn new(api_key: String, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            retry,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_url(&self, model: &str) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        )
    }

    async fn send_once(&self, url: &str, body: &GenerateContentRequest) -> Result<SendOutcome> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status().as_u16();

        if self.retry.is_retryable_status(status) {
            return Ok(SendOutcome::Transient(status));
        }
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("gemini returned status {status}: {detail}"));
        }

        let parsed: GenerateContentResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| anyhow!("gemini response contained no candidates"))?;

        Ok(SendOutcome::Done(text))
    }
}

enum SendOutcome {
    Done(String),
    Transient(u16),
}

#[async_trait]
impl ModelClient for GeminiModelClient {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<String> {
        let url = self.build_url(request.model);
        let body = GenerateContentRequest::from_instruction(request.instruction);

        if let Some(tool) = request.tool {
            debug!(stage = %request.stage, ?tool, "stage tool delegated to serving side");
        }

        for attempt in 0..self.retry.attempts {
            match self.send_once(&url, &body).await {
                Ok(SendOutcome::Done(text)) => return Ok(text),
                Ok(SendOutcome::Transient(status)) => {
                    if attempt + 1 >= self.retry.attempts {
                        return Err(anyhow!(
                            "gemini still returning status {status} after {} attempts",
                            self.retry.attempts
                        ));
                    }
                    let delay = self.retry.backoff_ms(attempt);
                    warn!(
                        stage = %request.stage,
                        status,
                        attempt = attempt + 1,
                        delay_ms = delay,
                        "transient model failure, backing off"
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(anyhow!("retry budget exhausted"))
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

impl GenerateContentRequest {
    fn from_instruction(instruction: &str) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: Some(instruction.to_string()),
                }],
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default = "default_role")]
    role: String,
    parts: Vec<Part>,
}

fn default_role() -> String {
    "model".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_embeds_model_and_key() {
        let client = GeminiModelClient::new("k123".into(), RetryPolicy::default());
        assert_eq!(
            client.build_url("gemini-2.5-flash-lite"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-lite:generateContent?key=k123"
        );
    }

    #[test]
    fn response_text_parses() {
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hello "},{"text":"world"}]}}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed.candidates[0]
            .content
            .parts
            .iter()
            .filter_map(|part| part.text.clone())
            .collect();
        assert_eq!(text, "hello world");
    }
}
