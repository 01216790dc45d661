//! Supabase REST-backed bot store and conversation sink.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ParleyError, Result};
use crate::session::ConversationRecord;
use crate::store::{BotStore, ConversationSink};
use crate::types::BotConfig;

/// Thin client over the PostgREST endpoints of a Supabase project.
pub struct SupabaseClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

#[async_trait]
impl BotStore for SupabaseClient {
    async fn fetch(&self, bot_id: &str, user_id: &str) -> Result<BotConfig> {
        let response = self
            .request(reqwest::Method::GET, "bots")
            .query(&[("id", format!("eq.{bot_id}")), ("select", "*".into())])
            .send()
            .await
            .map_err(|e| ParleyError::Other(e.into()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ParleyError::Auth(format!("supabase rejected credentials ({status})")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ParleyError::Other(anyhow::anyhow!(
                "supabase bots lookup failed ({status}): {body}"
            )));
        }

        let rows: Vec<BotConfig> = response
            .json()
            .await
            .map_err(|e| ParleyError::Other(e.into()))?;
        let bot = rows
            .into_iter()
            .next()
            .ok_or_else(|| ParleyError::NotFound(format!("bot {bot_id}")))?;
        if !bot.is_owned_by(user_id) {
            return Err(ParleyError::Unauthorized(format!(
                "bot {bot_id} does not belong to user {user_id}"
            )));
        }
        debug!(bot_id, "Fetched bot from supabase");
        Ok(bot)
    }
}

#[async_trait]
impl ConversationSink for SupabaseClient {
    async fn persist(&self, record: &ConversationRecord) -> Result<()> {
        let body = json!({
            "user_id": record.user_id,
            "bot_id": record.bot_id,
            "messages": record.messages,
            "timestamp": record.ended_at.to_rfc3339(),
        });
        let response = self
            .request(reqwest::Method::POST, "conversations")
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|e| ParleyError::Persistence(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED && !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, session_id = %record.session_id, "Supabase rejected conversation");
            return Err(ParleyError::Persistence(format!(
                "supabase insert failed ({status}): {text}"
            )));
        }
        debug!(session_id = %record.session_id, "Saved conversation to supabase");
        Ok(())
    }
}
