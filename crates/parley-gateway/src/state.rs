//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use parley_agent::{GeneratorSettings, ResponseGenerator};
use parley_core::config::{Config, StoreKind};
use parley_core::error::{ParleyError, Result};
use parley_core::store::{BotStore, ConversationSink, JsonBotStore, JsonlConversationSink};
use parley_core::supabase::SupabaseClient;
use parley_media::stt::{DeepgramConnector, TranscriberConnector};
use parley_media::tts::{DeepgramSynthesizer, SpeechSynthesizer};

use crate::metrics::MetricsCollector;
use crate::session::{SessionDeps, SessionSettings};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub bots: Arc<dyn BotStore>,
    pub conversations: Arc<dyn ConversationSink>,
    pub generator: Option<Arc<ResponseGenerator>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub transcriber: Option<Arc<dyn TranscriberConnector>>,
    pub metrics: Arc<MetricsCollector>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
    settings: SessionSettings,
}

/// Per-connection bookkeeping.
pub struct ConnectionState {
    pub conn_id: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl GatewayState {
    /// State with the given stores and no speech or model services.
    pub fn new(
        config: Arc<Config>,
        bots: Arc<dyn BotStore>,
        conversations: Arc<dyn ConversationSink>,
    ) -> Self {
        let settings = SessionSettings::from_config(&config);
        Self {
            config,
            bots,
            conversations,
            generator: None,
            synthesizer: None,
            transcriber: None,
            metrics: Arc::new(MetricsCollector::new()),
            connections: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            prometheus: None,
            settings,
        }
    }

    /// Wire stores, providers, and speech services from config.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let (bots, conversations) = build_stores(&config)?;
        let mut state = Self::new(config.clone(), bots, conversations);

        match parley_providers::build_from_config(&config) {
            Some((provider, credentials)) => {
                info!(provider = provider.id(), "Language model ready");
                state.generator = Some(Arc::new(ResponseGenerator::new(
                    provider,
                    credentials,
                    GeneratorSettings::from_config(&config),
                )));
            }
            None => warn!("No language model provider has an API key; replies disabled"),
        }

        match DeepgramSynthesizer::from_config(&config.tts()) {
            Some(synth) => state.synthesizer = Some(Arc::new(synth)),
            None => warn!("No TTS key configured; replies will be text-only"),
        }

        match config.stt().resolve_api_key() {
            Some(key) => state.transcriber = Some(Arc::new(DeepgramConnector::new(key))),
            None => warn!("No STT key configured; voice input disabled"),
        }

        Ok(state)
    }

    pub fn with_generator(mut self, generator: ResponseGenerator) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn TranscriberConnector>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Everything a new session needs.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            bots: self.bots.clone(),
            conversations: self.conversations.clone(),
            generator: self.generator.clone(),
            synthesizer: self.synthesizer.clone(),
            transcriber: self.transcriber.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Which backing services are configured, for `/health`.
    pub fn services(&self) -> serde_json::Value {
        let providers = self.config.providers();
        let keyed = |id: &str| {
            providers
                .iter()
                .any(|p| p.id == id && p.resolve_api_key().is_some())
        };
        serde_json::json!({
            "deepgram": self.transcriber.is_some() || self.synthesizer.is_some(),
            "gemini": keyed("google"),
            "openai": keyed("openai"),
            "supabase": self.config.store().kind == StoreKind::Supabase,
        })
    }
}

/// Bot store and conversation sink for the configured backend.
pub fn build_stores(config: &Config) -> Result<(Arc<dyn BotStore>, Arc<dyn ConversationSink>)> {
    let store = config.store();
    match store.kind {
        StoreKind::File => {
            let dir = config.store_dir();
            info!(dir = %dir.display(), "Using file store");
            let bots: Arc<dyn BotStore> = Arc::new(JsonBotStore::new(dir.clone()));
            let sink: Arc<dyn ConversationSink> = Arc::new(JsonlConversationSink::new(dir));
            Ok((bots, sink))
        }
        StoreKind::Supabase => {
            let url = store
                .supabase_url
                .clone()
                .ok_or_else(|| ParleyError::Config("store.supabase_url is required".into()))?;
            let key = store
                .resolve_supabase_key()
                .ok_or_else(|| ParleyError::Config("store.supabase_key is required".into()))?;
            info!(%url, "Using Supabase store");
            let client = Arc::new(SupabaseClient::new(url, key));
            let bots: Arc<dyn BotStore> = client.clone();
            let sink: Arc<dyn ConversationSink> = client;
            Ok((bots, sink))
        }
    }
}
