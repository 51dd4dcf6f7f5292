//! Gemini `generateContent` chat backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatBackend, ChatMessage, ChatRole};
use crate::error::{CounselError, Result};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct GeminiChat {
    client: Client,
    api_key: Option<String>,
    model: String,
    system_instruction: String,
    base_url: String,
}

impl std::fmt::Debug for GeminiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiChat")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GeminiChat {
    pub fn new(
        api_key: Option<String>,
        model: impl Into<String>,
        system_instruction: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CounselError::Chat(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            system_instruction: system_instruction.into(),
            base_url: API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn model_path(&self) -> String {
        let model = self.model.trim_start_matches("models/");
        format!("{}/models/{}:generateContent", self.base_url.trim_end_matches('/'), model)
    }
}

/// Gemini expects the conversation to open with a user turn, so leading
/// model messages (the greeting) are left out.
fn to_contents(history: &[ChatMessage], message: &str) -> Vec<Content> {
    history
        .iter()
        .skip_while(|m| m.role == ChatRole::Model)
        .map(|m| Content {
            role: match m.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            },
            parts: vec![Part {
                text: m.text.clone(),
            }],
        })
        .chain(std::iter::once(Content {
            role: "user",
            parts: vec![Part {
                text: message.to_string(),
            }],
        }))
        .collect()
}

#[async_trait]
impl ChatBackend for GeminiChat {
    async fn send_message(&self, history: &[ChatMessage], message: &str) -> Result<String> {
        let key = self.api_key.as_deref().ok_or(CounselError::CredentialMissing)?;

        let body = GenerateRequest {
            contents: to_contents(history, message),
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: self.system_instruction.clone(),
                }],
            },
        };
        debug!(model = %self.model, contents = body.contents.len(), "generateContent request");

        let response = self
            .client
            .post(self.model_path())
            .query(&[("key", key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| CounselError::Chat(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(CounselError::Chat(format!("HTTP {status}: {text}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| CounselError::Chat(format!("invalid response: {e}")))?;
        reply_text(parsed)
    }
}

fn reply_text(response: GenerateResponse) -> Result<String> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| CounselError::Chat("response had no candidates".into()))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(CounselError::Chat(format!(
            "empty reply (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(text)
}

// ── Wire types ──

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}
