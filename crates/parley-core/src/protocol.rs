//! Parley voice wire protocol.
//!
//! JSON text frames over WebSocket, tagged by `type`. Client messages are a
//! closed set; anything else is rejected at the boundary. Server frames carry
//! the event plus its emission `timestamp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Client -> Server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        #[serde(rename = "botId")]
        bot_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "authToken", default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    AudioChunk {
        /// Base64 PCM s16le, 16 kHz mono.
        audio: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<serde_json::Value>,
    },
    TextMessage {
        text: String,
    },
    Interrupt,
    StopSession,
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn parse(raw: &str) -> Result<Self> {
        let msg: ClientMessage = serde_json::from_str(raw)
            .map_err(|e| ParleyError::Protocol(format!("invalid message: {e}")))?;
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::StartSession {
                bot_id, user_id, ..
            } => {
                if bot_id.trim().is_empty() {
                    return Err(ParleyError::Protocol("botId is required".into()));
                }
                if user_id.trim().is_empty() {
                    return Err(ParleyError::Protocol("userId is required".into()));
                }
            }
            Self::AudioChunk { audio, .. } if audio.is_empty() => {
                return Err(ParleyError::Protocol("audio is empty".into()));
            }
            Self::TextMessage { text } if text.trim().is_empty() => {
                return Err(ParleyError::Protocol("text is empty".into()));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "start_session",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::TextMessage { .. } => "text_message",
            Self::Interrupt => "interrupt",
            Self::StopSession => "stop_session",
        }
    }
}

/// Server -> Client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionReady,
    SessionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "botName")]
        bot_name: String,
    },
    SttReady,
    Transcript {
        transcript: String,
        confidence: f64,
        is_final: bool,
    },
    SpeechStarted,
    SpeechEnded,
    UserMessage {
        content: String,
    },
    AiResponse {
        content: String,
    },
    AudioResponse {
        /// Base64 audio.
        audio: String,
        text: String,
        format: String,
    },
    Interrupted,
    ProcessingError {
        message: String,
    },
    SttError {
        message: String,
    },
    TtsError {
        message: String,
    },
    SessionEnded,
}

impl ServerEvent {
    pub fn processing_error(message: impl Into<String>) -> Self {
        Self::ProcessingError {
            message: message.into(),
        }
    }

    /// Wrap the event with the current time.
    pub fn stamp(self) -> OutboundFrame {
        OutboundFrame {
            event: self,
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionReady => "connection_ready",
            Self::SessionStarted { .. } => "session_started",
            Self::SttReady => "stt_ready",
            Self::Transcript { .. } => "transcript",
            Self::SpeechStarted => "speech_started",
            Self::SpeechEnded => "speech_ended",
            Self::UserMessage { .. } => "user_message",
            Self::AiResponse { .. } => "ai_response",
            Self::AudioResponse { .. } => "audio_response",
            Self::Interrupted => "interrupted",
            Self::ProcessingError { .. } => "processing_error",
            Self::SttError { .. } => "stt_error",
            Self::TtsError { .. } => "tts_error",
            Self::SessionEnded => "session_ended",
        }
    }
}

/// A server event as it goes on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub timestamp: DateTime<Utc>,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
