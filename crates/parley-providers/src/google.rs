//! Google Generative AI (Gemini) provider.
//!
//! Implements streaming via the `streamGenerateContent` endpoint with SSE.
//! Auth is via API key in query parameter.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    pub base_url: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// Gemini uses "model" for the assistant role.
fn format_contents(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect()
}

// --- Gemini request/response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Split one Gemini stream chunk into text, stop, and usage chunks, in that order.
fn translate_chunk(chunk: GeminiStreamChunk) -> Vec<CompletionChunk> {
    let mut out = Vec::new();
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if !text.is_empty() {
            out.push(CompletionChunk {
                delta: Some(text),
                ..Default::default()
            });
        }
        if let Some(reason) = candidate.finish_reason {
            if reason != "STOP" {
                trace!(reason, "Gemini finish reason");
            }
            out.push(CompletionChunk {
                stop_reason: Some(reason),
                ..Default::default()
            });
        }
    }
    if let Some(usage) = chunk.usage_metadata {
        out.push(CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: Some(usage.prompt_token_count),
                output_tokens: Some(usage.candidates_token_count),
            }),
            ..Default::default()
        });
    }
    out
}

struct GeminiChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    pending: VecDeque<CompletionChunk>,
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        "google"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let api_key = match credentials {
            Credentials::ApiKey { api_key } => api_key.clone(),
            _ => anyhow::bail!("Gemini requires ApiKey credentials"),
        };

        let system_instruction = request.system.as_ref().map(|s| {
            json!({
                "parts": [{ "text": s }]
            })
        });

        let body = GeminiRequest {
            contents: format_contents(&request.messages),
            system_instruction,
            generation_config: Some(GenerationConfig {
                max_output_tokens: Some(request.max_tokens),
                temperature: request.temperature,
            }),
        };

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, request.model, api_key
        );

        debug!(model = %request.model, messages = body.contents.len(), "Streaming Gemini API");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {status}: {body}");
        }

        let chunk_stream = futures::stream::unfold(
            GeminiChunkState {
                sse: Box::pin(parse_sse_stream(response)),
                pending: VecDeque::new(),
            },
            |mut state| async move {
                loop {
                    if let Some(chunk) = state.pending.pop_front() {
                        return Some((Ok(chunk), state));
                    }
                    match state.sse.next().await {
                        Some(Ok(event)) => {
                            match serde_json::from_str::<GeminiStreamChunk>(event.data.trim()) {
                                Ok(chunk) => state.pending.extend(translate_chunk(chunk)),
                                Err(e) => trace!(%e, "Failed to parse Gemini chunk"),
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
