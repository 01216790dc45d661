use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Persona a session talks to. Fetched once when the session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Free-form persona description used in the system prompt.
    #[serde(default, alias = "personality")]
    pub persona: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_auto_speak")]
    pub auto_speak: bool,
    /// Owning user. Unowned bots are available to everyone.
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

fn default_auto_speak() -> bool {
    true
}

impl BotConfig {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        match &self.owner {
            Some(owner) => owner == user_id,
            None => true,
        }
    }

    /// Name shown to clients; falls back to the id when unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// One recognition result from the transcriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, is_final: bool, confidence: f64) -> Self {
        Self {
            text: text.into(),
            is_final,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        }
    }

    /// Whether this result should start a conversational turn.
    pub fn advances_turn(&self, threshold: f64) -> bool {
        self.is_final && self.confidence >= threshold && !self.text.trim().is_empty()
    }
}

/// Raw PCM from the client (s16le, mono).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ParleyError::Protocol(format!("invalid base64 audio: {e}")))?;
        if bytes.is_empty() {
            return Err(ParleyError::Protocol("empty audio chunk".into()));
        }
        Ok(Self::new(bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
