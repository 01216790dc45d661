//! Text-to-speech synthesis.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use parley_core::config::TtsConfig;

use crate::pcm::{estimate_speech_duration, pcm_duration};

const DEEPGRAM_SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// Raw s16le mono, no container.
    Linear16,
    Mp3,
}

impl AudioEncoding {
    pub fn parse(s: &str) -> Self {
        match s {
            "mp3" => Self::Mp3,
            _ => Self::Linear16,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear16 => "linear16",
            Self::Mp3 => "mp3",
        }
    }
}

/// One synthesized reply.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: AudioEncoding,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    /// How long the client will take to play this audio. Exact for linear16,
    /// estimated from the spoken text otherwise.
    pub fn duration(&self, text: &str) -> Duration {
        match self.format {
            AudioEncoding::Linear16 => pcm_duration(self.bytes.len(), self.sample_rate),
            AudioEncoding::Mp3 => estimate_speech_duration(text),
        }
    }
}

/// Converts reply text into audio. Stateless; one call per reply.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedAudio>;
}

/// Deepgram Aura speech synthesis.
pub struct DeepgramSynthesizer {
    client: reqwest::Client,
    api_key: String,
    encoding: AudioEncoding,
    sample_rate: u32,
    endpoint: String,
}

impl DeepgramSynthesizer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            encoding: AudioEncoding::Linear16,
            sample_rate: 24_000,
            endpoint: DEEPGRAM_SPEAK_URL.into(),
        }
    }

    /// Build from config. `None` when no API key is available.
    pub fn from_config(config: &TtsConfig) -> Option<Self> {
        let api_key = config.resolve_api_key()?;
        let mut synth = Self::new(api_key);
        synth.encoding = AudioEncoding::parse(config.encoding());
        synth.sample_rate = config.sample_rate();
        Some(synth)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn speak_url(&self, voice: &str) -> String {
        match self.encoding {
            AudioEncoding::Linear16 => format!(
                "{}?model={voice}&encoding=linear16&sample_rate={}&container=none",
                self.endpoint, self.sample_rate
            ),
            AudioEncoding::Mp3 => format!("{}?model={voice}&encoding=mp3", self.endpoint),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedAudio> {
        if text.trim().is_empty() {
            anyhow::bail!("nothing to synthesize: text is empty");
        }

        let url = self.speak_url(voice);
        debug!(voice, text_len = text.len(), encoding = self.encoding.as_str(), "Requesting speech");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Deepgram speak error {status}: {body}");
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            anyhow::bail!("Deepgram speak returned no audio");
        }

        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            format: self.encoding,
            sample_rate: self.sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speak_url_linear16() {
        let url = DeepgramSynthesizer::new("k").speak_url("aura-2-thalia-en");
        assert_eq!(
            url,
            "https://api.deepgram.com/v1/speak?model=aura-2-thalia-en&encoding=linear16&sample_rate=24000&container=none"
        );
    }

    #[test]
    fn test_speak_url_mp3() {
        let config = TtsConfig {
            api_key: Some("k".into()),
            encoding: Some("mp3".into()),
            ..Default::default()
        };
        let synth = DeepgramSynthesizer::from_config(&config).unwrap();
        assert!(synth.speak_url("aura-asteria-en").ends_with("encoding=mp3"));
    }

    #[tokio::test]
    async fn test_rejects_blank_text() {
        let synth = DeepgramSynthesizer::new("k").with_endpoint("http://127.0.0.1:9");
        let err = synth.synthesize("   ", "v").await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_duration() {
        let audio = SynthesizedAudio {
            bytes: vec![0; 48_000],
            format: AudioEncoding::Linear16,
            sample_rate: 24_000,
        };
        assert_eq!(audio.duration("ignored"), Duration::from_secs(1));

        let mp3 = SynthesizedAudio {
            bytes: vec![0; 10],
            format: AudioEncoding::Mp3,
            sample_rate: 24_000,
        };
        assert_eq!(mp3.duration("hi"), Duration::from_millis(500));
    }
}
