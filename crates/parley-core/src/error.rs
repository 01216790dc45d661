use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transcriber error: {0}")]
    Transcriber(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth(_) => "auth",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Protocol(_) => "protocol",
            Self::Transcriber(_) => "stt",
            Self::Synthesis(_) => "tts",
            Self::Generation(_) => "generation",
            Self::Persistence(_) => "persistence",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }

    /// Errors that prevent a session from ever becoming active.
    pub fn is_fatal_at_start(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Auth(_) | Self::NotFound(_) | Self::Unauthorized(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
