//! Reply generation with timeout, one retry, and a spoken fallback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::config::Config;
use parley_core::session::Message;
use parley_core::types::BotConfig;
use parley_providers::{CompletionRequest, Credentials, LlmProvider};

use crate::prompt::{build_messages, build_system_prompt};

/// Spoken when every attempt fails, so the conversation can continue.
pub const FALLBACK_REPLY: &str =
    "I'm sorry, I had trouble responding just now. Could you say that again?";

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub history_window: usize,
    pub max_attempts: u32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            default_model: "gemini-2.0-flash".into(),
            max_tokens: 512,
            temperature: Some(0.8),
            timeout: Duration::from_secs(20),
            history_window: 20,
            max_attempts: 2,
        }
    }
}

impl GeneratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config.default_model(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            timeout: Duration::from_millis(config.generation_timeout_ms()),
            history_window: config.history_window(),
            max_attempts: 2,
        }
    }
}

/// Result of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    /// True when `text` is the fallback apology.
    pub fallback: bool,
    pub attempts: u32,
    /// Last error when the fallback was used.
    pub error: Option<String>,
}

pub struct ResponseGenerator {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    settings: GeneratorSettings,
}

impl ResponseGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            provider,
            credentials,
            settings,
        }
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Produce the reply to `user_text`. `history` is the conversation before it.
    /// Never fails: after the last attempt the fallback apology is returned.
    pub async fn generate(
        &self,
        bot: &BotConfig,
        history: &[Message],
        user_text: &str,
    ) -> GenerationOutcome {
        let request = CompletionRequest {
            model: bot
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.settings.default_model.clone()),
            messages: build_messages(history, self.settings.history_window, user_text),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: Some(build_system_prompt(bot)),
        };

        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            debug!(
                provider = self.provider.id(),
                model = %request.model,
                attempt,
                context = request.messages.len(),
                "Generating reply"
            );
            let call = self.provider.complete(&request, &self.credentials);
            match tokio::time::timeout(self.settings.timeout, call).await {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    info!(bot = %bot.id, attempt, chars = text.len(), "Reply generated");
                    return GenerationOutcome {
                        text: text.trim().to_string(),
                        fallback: false,
                        attempts: attempt,
                        error: None,
                    };
                }
                Ok(Ok(_)) => last_error = "model returned an empty reply".into(),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "generation timed out after {}ms",
                        self.settings.timeout.as_millis()
                    )
                }
            }
            warn!(bot = %bot.id, attempt, error = %last_error, "Generation attempt failed");
        }

        GenerationOutcome {
            text: FALLBACK_REPLY.to_string(),
            fallback: true,
            attempts: max_attempts,
            error: Some(last_error),
        }
    }
}
