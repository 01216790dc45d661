//! LLM provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to stream chat
//! completions from a different API (Gemini, OpenAI-compatible).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_core::config::Config;
use parley_core::session::Role;

pub mod failover;
pub mod google;
pub mod openai;
pub mod sse;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    #[serde(rename = "token")]
    Token { token: String },
}

/// One turn of model context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<String>,
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "google", "openai").
    fn id(&self) -> &str;

    /// Stream a chat completion.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream>;

    /// Run a completion to the end and return the concatenated text.
    async fn complete(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<String> {
        let mut stream = self.stream(request, credentials).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.delta {
                text.push_str(&delta);
            }
            if let Some(usage) = chunk.usage {
                debug!(
                    provider = self.id(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Completion usage"
                );
            }
        }
        Ok(text)
    }
}

/// Instantiate a provider by id.
pub fn create_provider(id: &str, base_url: Option<&str>) -> Option<Arc<dyn LlmProvider>> {
    match id {
        "google" | "gemini" => Some(Arc::new(google::GeminiProvider::new(base_url))),
        "openai" => Some(Arc::new(openai::OpenAiProvider::new(base_url))),
        _ => None,
    }
}

/// Build the provider chain from config: every configured provider that has a
/// key, in priority order. `None` when no provider is usable.
pub fn build_from_config(config: &Config) -> Option<(Arc<dyn LlmProvider>, Credentials)> {
    let mut chain: Vec<(Arc<dyn LlmProvider>, Credentials)> = Vec::new();
    for provider_config in config.providers() {
        let Some(api_key) = provider_config.resolve_api_key() else {
            debug!(provider = %provider_config.id, "Skipping provider without API key");
            continue;
        };
        let Some(provider) =
            create_provider(&provider_config.id, provider_config.base_url.as_deref())
        else {
            tracing::warn!(provider = %provider_config.id, "Unknown provider id");
            continue;
        };
        chain.push((provider, Credentials::ApiKey { api_key }));
    }

    match chain.len() {
        0 => None,
        1 => chain.pop(),
        _ => {
            let creds = chain[0].1.clone();
            let failover = failover::FailoverProvider::new("failover".into(), chain);
            Some((Arc::new(failover), creds))
        }
    }
}
