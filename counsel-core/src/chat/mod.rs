//! Text chat: ordered history plus one request per user turn.

pub mod gemini;

pub use gemini::GeminiChat;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CounselError, Result};

pub const DEFAULT_PERSONA: &str = "You are a warm, patient counselling assistant. Listen carefully, \
reflect back what you hear, ask gentle open questions, and keep replies short and conversational. \
You are not a substitute for a licensed professional; if someone may be in danger, encourage them \
to contact local emergency services or a crisis line.";

pub const DEFAULT_GREETING: &str =
    "Hello, I'm here to listen. What would you like to talk about today?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            text: text.into(),
            sent_at: Utc::now(),
        }
    }
}

/// A request/response text model.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Reply to `message` given the conversation so far (`history` does not
    /// include `message`).
    async fn send_message(&self, history: &[ChatMessage], message: &str) -> Result<String>;
}

pub struct ChatController {
    backend: Arc<dyn ChatBackend>,
    greeting: String,
    history: Vec<ChatMessage>,
}

impl ChatController {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self::with_greeting(backend, DEFAULT_GREETING)
    }

    pub fn with_greeting(backend: Arc<dyn ChatBackend>, greeting: impl Into<String>) -> Self {
        let greeting = greeting.into();
        Self {
            backend,
            history: vec![ChatMessage::model(greeting.clone())],
            greeting,
        }
    }

    /// Send one user turn and return the reply.
    ///
    /// On failure the user message stays in the history so the caller can
    /// show what was sent alongside the error.
    ///
    /// # Errors
    /// `Chat` for blank input or when the backend fails.
    pub async fn send(&mut self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CounselError::Chat("message is empty".into()));
        }

        let prior = self.history.len();
        self.history.push(ChatMessage::user(text));
        debug!(turns = prior, "sending chat message");

        match self.backend.send_message(&self.history[..prior], text).await {
            Ok(reply) => {
                self.history.push(ChatMessage::model(reply.clone()));
                Ok(reply)
            }
            Err(e) => {
                warn!("chat request failed: {e}");
                Err(e)
            }
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Forget the conversation, keeping only the greeting.
    pub fn clear(&mut self) {
        self.history.clear();
        self.history.push(ChatMessage::model(self.greeting.clone()));
    }
}
