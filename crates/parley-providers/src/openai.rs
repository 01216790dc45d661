//! OpenAI Chat Completions API provider.
//!
//! Streams via `/v1/chat/completions`. Any OpenAI-compatible endpoint works
//! through `base_url`.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::session::Role;

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{
    ChatMessage, ChunkUsage, CompletionChunk, CompletionRequest, CompletionStream, Credentials,
    LlmProvider,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

fn format_messages(system: Option<&str>, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        out.push(json!({ "role": "system", "content": system }));
    }
    for m in messages {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push(json!({ "role": role, "content": m.content }));
    }
    out
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn translate_chunk(chunk: ChatCompletionChunk) -> Vec<CompletionChunk> {
    let mut out = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            out.push(CompletionChunk {
                delta: Some(text),
                ..Default::default()
            });
        }
        if let Some(reason) = choice.finish_reason {
            out.push(CompletionChunk {
                stop_reason: Some(reason),
                ..Default::default()
            });
        }
    }
    if let Some(usage) = chunk.usage {
        out.push(CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            }),
            ..Default::default()
        });
    }
    out
}

struct OpenAiChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    pending: VecDeque<CompletionChunk>,
    done: bool,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let bearer = match credentials {
            Credentials::ApiKey { api_key } => api_key.clone(),
            Credentials::Token { token } => token.clone(),
        };

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: format_messages(request.system.as_deref(), &request.messages),
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {bearer}"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        let chunk_stream = futures::stream::unfold(
            OpenAiChunkState {
                sse: Box::pin(parse_sse_stream(response)),
                pending: VecDeque::new(),
                done: false,
            },
            |mut state| async move {
                loop {
                    if let Some(chunk) = state.pending.pop_front() {
                        return Some((Ok(chunk), state));
                    }
                    if state.done {
                        return None;
                    }
                    match state.sse.next().await {
                        Some(Ok(event)) => {
                            let data = event.data.trim();
                            // Stream terminates with "data: [DONE]"
                            if data == "[DONE]" {
                                state.done = true;
                                continue;
                            }
                            match serde_json::from_str::<ChatCompletionChunk>(data) {
                                Ok(chunk) => state.pending.extend(translate_chunk(chunk)),
                                Err(e) => trace!(%e, data, "Failed to parse OpenAI chunk"),
                            }
                        }
                        Some(Err(e)) => return Some((Err(e), state)),
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_provider_creation() {
        let provider = OpenAiProvider::new(None);
        assert_eq!(provider.id(), "openai");
        assert_eq!(provider.base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn test_format_messages_with_system() {
        let messages = format_messages(
            Some("Be brief."),
            &[ChatMessage::user("hi"), ChatMessage::assistant("hello")],
        );
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "hello");
    }

    #[test]
    fn test_chunk_text_and_finish() {
        let json = r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        let out = translate_chunk(chunk);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].delta.as_deref(), Some("Hi"));
        assert_eq!(out[1].stop_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_chunk_usage_only() {
        let json = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        let out = translate_chunk(chunk);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].usage.as_ref().unwrap().output_tokens, Some(3));
    }
}
