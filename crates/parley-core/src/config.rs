//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use serde::{Deserialize, Serialize};

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    /// Allowed browser origins. Empty = allow any.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// "none", "token", or "password". Inferred from the configured secret when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl GatewayAuthConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret_field(&self.password, &self.password_env)
    }

    pub fn effective_mode(&self) -> &str {
        if let Some(mode) = self.mode.as_deref() {
            return mode;
        }
        if self.token.is_some() || self.token_env.is_some() {
            "token"
        } else if self.password.is_some() || self.password_env.is_some() {
            "password"
        } else {
            "none"
        }
    }
}

// --- Speech-to-text ---

/// Streaming speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Provider (default: "deepgram").
    #[serde(default = "default_stt_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Recognition model (default: "nova-2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// BCP-47 language tag (default: "en-US").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Inbound PCM sample rate in Hz (default: 16000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    /// Minimum confidence for a final transcript to start a turn (default: 0.6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,

    /// Silence the provider waits before sending an utterance-end event (default: 1000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utterance_end_ms: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Audio chunks held while reconnecting; oldest dropped on overflow (default: 50).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_buffer_chunks: Option<usize>,

    /// Upper bound on one connection attempt, handshake included (default: 10000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

fn default_stt_provider() -> String {
    "deepgram".into()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
            sample_rate: None,
            confidence_threshold: None,
            utterance_end_ms: None,
            retry: None,
            reconnect_buffer_chunks: None,
            connect_timeout_ms: None,
        }
    }
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| std::env::var("DEEPGRAM_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

/// Reconnect policy for the upstream transcription socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,

    /// "fixed" (default) or "exponential".
    #[serde(default = "default_backoff")]
    pub backoff: String,

    /// Upper bound for exponential backoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_backoff() -> String {
    "fixed".into()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
            backoff: default_backoff(),
            max_delay_ms: None,
        }
    }
}

// --- Text-to-speech ---

/// Text-to-speech (TTS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "deepgram").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Voice used when the bot does not name one (default: "aura-2-thalia-en").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// "linear16" (default) or "mp3".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,

    /// Output sample rate for linear16 (default: 24000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_tts_provider() -> String {
    "deepgram".into()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            default_voice: None,
            encoding: None,
            sample_rate: None,
            timeout_ms: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| std::env::var("DEEPGRAM_API_KEY").ok().filter(|k| !k.is_empty()))
    }

    pub fn voice(&self) -> &str {
        self.default_voice.as_deref().unwrap_or("aura-2-thalia-en")
    }

    pub fn encoding(&self) -> &str {
        self.encoding.as_deref().unwrap_or("linear16")
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(24_000)
    }
}

// --- Language models ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model used when the bot does not name one (default: "gemini-2.0-flash").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Caller-side timeout per generation attempt (default: 20000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Providers in priority order; later entries are failover targets.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// "google" or "openai".
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Session behaviour ---

/// What to do with a final transcript that arrives while a reply is being generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Discard the new utterance and log it.
    Drop,
    /// Hold the newest utterance in a single slot and answer it next.
    #[default]
    QueueLatest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Trailing messages sent to the model as context (default: 20).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_window: Option<usize>,

    #[serde(default)]
    pub overlap_policy: OverlapPolicy,

    /// RMS energy threshold for server-side voice activity (default: 300).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_threshold: Option<f64>,

    /// Silent 20ms frames before speech is considered ended (default: 15).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_hangover_frames: Option<usize>,
}

// --- Stores ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    File,
    Supabase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory holding `bots.json` and `conversations.jsonl` (default: `~/.parley/data`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supabase_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supabase_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supabase_key_env: Option<String>,
}

impl StoreConfig {
    pub fn resolve_supabase_key(&self) -> Option<String> {
        resolve_secret_field(&self.supabase_key, &self.supabase_key_env)
    }
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Result of checking which credentials are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub valid: bool,
    pub missing_keys: Vec<String>,
    pub optional_missing: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::ParleyError::Io)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8000)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn stt(&self) -> SttConfig {
        self.stt.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    /// Minimum confidence for a final transcript to advance the conversation.
    pub fn confidence_threshold(&self) -> f64 {
        self.stt
            .as_ref()
            .and_then(|s| s.confidence_threshold)
            .unwrap_or(0.6)
    }

    pub fn default_model(&self) -> String {
        self.models
            .as_ref()
            .and_then(|m| m.default_model.clone())
            .or_else(|| {
                self.models
                    .as_ref()
                    .and_then(|m| m.providers.first())
                    .and_then(|p| p.default_model.clone())
            })
            .unwrap_or_else(|| "gemini-2.0-flash".to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.models
            .as_ref()
            .and_then(|m| m.max_tokens)
            .unwrap_or(512)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.models
            .as_ref()
            .and_then(|m| m.temperature)
            .or(Some(0.8))
    }

    pub fn generation_timeout_ms(&self) -> u64 {
        self.models
            .as_ref()
            .and_then(|m| m.timeout_ms)
            .unwrap_or(20_000)
    }

    pub fn synthesis_timeout_ms(&self) -> u64 {
        self.tts
            .as_ref()
            .and_then(|t| t.timeout_ms)
            .unwrap_or(15_000)
    }

    /// Providers in priority order. Falls back to `GEMINI_API_KEY` / `OPENAI_API_KEY`
    /// from the environment when none are configured.
    pub fn providers(&self) -> Vec<ProviderConfig> {
        let configured = self
            .models
            .as_ref()
            .map(|m| m.providers.clone())
            .unwrap_or_default();
        if !configured.is_empty() {
            return configured;
        }
        vec![
            ProviderConfig {
                id: "google".into(),
                api_key_env: Some("GEMINI_API_KEY".into()),
                api_key: None,
                base_url: None,
                default_model: None,
            },
            ProviderConfig {
                id: "openai".into(),
                api_key_env: Some("OPENAI_API_KEY".into()),
                api_key: None,
                base_url: None,
                default_model: Some("gpt-4o-mini".into()),
            },
        ]
    }

    pub fn history_window(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.history_window)
            .unwrap_or(20)
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.session
            .as_ref()
            .map(|s| s.overlap_policy)
            .unwrap_or_default()
    }

    pub fn vad_threshold(&self) -> f64 {
        self.session
            .as_ref()
            .and_then(|s| s.vad_threshold)
            .unwrap_or(300.0)
    }

    pub fn vad_hangover_frames(&self) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.vad_hangover_frames)
            .unwrap_or(15)
    }

    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    /// Directory used by the file-backed stores.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("data"))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.stt().resolve_api_key().is_none() {
            warnings.push("Speech-to-text has no API key configured; voice input disabled".into());
        }
        if self.tts().resolve_api_key().is_none() {
            warnings.push("Text-to-speech has no API key configured; replies will be text-only".into());
        }
        if !self
            .providers()
            .iter()
            .any(|p| p.resolve_api_key().is_some())
        {
            warnings.push("No language model provider has an API key configured".into());
        }

        let store = self.store();
        if store.kind == StoreKind::Supabase {
            match store.supabase_url.as_deref() {
                None => errors.push("Supabase store selected but supabase_url is missing".into()),
                Some(url) if !url.starts_with("https://") => {
                    warnings.push("supabase_url should start with https://".into())
                }
                _ => {}
            }
            if store.resolve_supabase_key().is_none() {
                errors.push("Supabase store selected but no supabase key configured".into());
            }
        }

        let threshold = self.confidence_threshold();
        if !(0.0..=1.0).contains(&threshold) {
            errors.push(format!("stt.confidence_threshold must be within 0..1, got {threshold}"));
        }

        if let Some(retry) = self.stt.as_ref().and_then(|s| s.retry.as_ref()) {
            if retry.backoff != "fixed" && retry.backoff != "exponential" {
                errors.push(format!("Unknown stt.retry.backoff '{}'", retry.backoff));
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Credential presence report served at `/api/environment/validate`.
    pub fn environment_report(&self) -> EnvironmentReport {
        let mut missing_keys = Vec::new();
        let mut optional_missing = Vec::new();
        let mut recommendations = Vec::new();

        if self.stt().resolve_api_key().is_none() {
            missing_keys.push("DEEPGRAM_API_KEY".to_string());
        }
        let providers = self.providers();
        let google_key = providers
            .iter()
            .any(|p| p.id == "google" && p.resolve_api_key().is_some());
        let openai_key = providers
            .iter()
            .any(|p| p.id == "openai" && p.resolve_api_key().is_some());
        if !google_key {
            if openai_key {
                optional_missing.push("GEMINI_API_KEY".to_string());
            } else {
                missing_keys.push("GEMINI_API_KEY".to_string());
            }
        }
        if !openai_key {
            optional_missing.push("OPENAI_API_KEY".to_string());
        }
        let store = self.store();
        if store.kind == StoreKind::Supabase && store.resolve_supabase_key().is_none() {
            missing_keys.push("SUPABASE_ANON_KEY".to_string());
        }

        if !missing_keys.is_empty() {
            recommendations.push("Missing critical API keys - some features will not work".into());
        }
        if !openai_key {
            recommendations.push("Add OPENAI_API_KEY to enable language model failover".into());
        }

        EnvironmentReport {
            valid: missing_keys.is_empty(),
            missing_keys,
            optional_missing,
            recommendations,
        }
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
