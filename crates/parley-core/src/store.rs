//! Bot lookup and conversation persistence.
//!
//! The file-backed stores keep everything under one directory:
//! - `<dir>/bots.json`: array of `BotConfig`
//! - `<dir>/conversations.jsonl`: one `ConversationRecord` per line

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ParleyError, Result};
use crate::session::ConversationRecord;
use crate::types::BotConfig;

/// Source of bot personas.
#[async_trait]
pub trait BotStore: Send + Sync {
    /// Fetch a bot the user is allowed to talk to.
    ///
    /// Returns `NotFound` for unknown ids and `Unauthorized` when the bot
    /// belongs to someone else.
    async fn fetch(&self, bot_id: &str, user_id: &str) -> Result<BotConfig>;
}

/// Append-only sink for finished conversations.
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn persist(&self, record: &ConversationRecord) -> Result<()>;
}

/// Bots read from a JSON file. The file is re-read on every fetch so edits apply
/// to new sessions without a restart.
pub struct JsonBotStore {
    path: PathBuf,
}

impl JsonBotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            path: dir.join("bots.json"),
        }
    }

    async fn load(&self) -> Result<Vec<BotConfig>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let bots: Vec<BotConfig> = serde_json::from_str(&data)
            .map_err(|e| ParleyError::Config(format!("corrupt bots file: {e}")))?;
        Ok(bots)
    }
}

#[async_trait]
impl BotStore for JsonBotStore {
    async fn fetch(&self, bot_id: &str, user_id: &str) -> Result<BotConfig> {
        let bot = self
            .load()
            .await?
            .into_iter()
            .find(|b| b.id == bot_id)
            .ok_or_else(|| ParleyError::NotFound(format!("bot {bot_id}")))?;
        if !bot.is_owned_by(user_id) {
            return Err(ParleyError::Unauthorized(format!(
                "bot {bot_id} does not belong to user {user_id}"
            )));
        }
        debug!(bot_id, name = %bot.name, "Loaded bot");
        Ok(bot)
    }
}

/// Conversations appended to a JSONL file.
pub struct JsonlConversationSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlConversationSink {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            path: dir.join("conversations.jsonl"),
            write_lock: Mutex::new(()),
        }
    }

    /// Read back every stored record.
    pub async fn load_all(&self) -> Result<Vec<ConversationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ConversationRecord = serde_json::from_str(line).map_err(|e| {
                ParleyError::Persistence(format!("corrupt conversation line: {e}"))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl ConversationSink for JsonlConversationSink {
    async fn persist(&self, record: &ConversationRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ParleyError::Persistence(e.to_string()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ParleyError::Persistence(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| ParleyError::Persistence(e.to_string()))?;

        debug!(
            session_id = %record.session_id,
            messages = record.messages.len(),
            "Persisted conversation"
        );
        Ok(())
    }
}
