//! Streaming speech-to-text.
//!
//! A [`StreamingTranscriber`] owns one upstream connection per session. It
//! forwards audio, surfaces recognition events, and reconnects under a
//! [`RetryPolicy`] when the upstream fails. Audio that arrives while
//! disconnected is held in a bounded buffer and flushed in order on reconnect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::{RetryConfig, SttConfig};
use parley_core::types::{AudioChunk, TranscriptEvent};

/// Events delivered to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// The upstream connection is live (again).
    Ready,
    Transcript(TranscriptEvent),
    SpeechStarted,
    UtteranceEnd,
    Error { message: String, fatal: bool },
    /// The adapter has stopped; no further events follow.
    Closed,
}

/// Recognition events from a live upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Transcript(TranscriptEvent),
    SpeechStarted,
    UtteranceEnd,
}

/// A live upstream connection.
///
/// Dropping `audio` asks the upstream to finish and close. An `Err` on
/// `events`, or the channel closing, means the connection is gone.
pub struct TranscriberLink {
    pub audio: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<Result<UpstreamEvent>>,
}

/// Recognition parameters for one connection.
#[derive(Debug, Clone)]
pub struct SttOptions {
    pub model: String,
    pub language: String,
    pub sample_rate: u32,
    pub utterance_end_ms: u32,
    /// A connection attempt taking longer than this counts as failed.
    pub connect_timeout: Duration,
}

impl Default for SttOptions {
    fn default() -> Self {
        Self {
            model: "nova-2".into(),
            language: "en-US".into(),
            sample_rate: 16_000,
            utterance_end_ms: 1_000,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SttOptions {
    pub fn from_config(config: &SttConfig) -> Self {
        let defaults = Self::default();
        Self {
            model: config.model.clone().unwrap_or(defaults.model),
            language: config.language.clone().unwrap_or(defaults.language),
            sample_rate: config.sample_rate.unwrap_or(defaults.sample_rate),
            utterance_end_ms: config.utterance_end_ms.unwrap_or(defaults.utterance_end_ms),
            connect_timeout: config
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
        }
    }
}

/// Opens upstream transcription connections.
#[async_trait]
pub trait TranscriberConnector: Send + Sync {
    async fn connect(&self, options: &SttOptions) -> Result<TranscriberLink>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { max_delay: Duration },
}

/// How often and how patiently to reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let base_delay = Duration::from_millis(config.delay_ms);
        let backoff = match config.backoff.as_str() {
            "exponential" => Backoff::Exponential {
                max_delay: Duration::from_millis(config.max_delay_ms.unwrap_or(30_000)),
            },
            _ => Backoff::Fixed,
        };
        Self {
            max_attempts: config.max_attempts,
            base_delay,
            backoff,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        match &self.backoff {
            Backoff::Fixed => Some(self.base_delay),
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                Some(self.base_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }
}

/// Bounded FIFO of audio waiting for a connection. Drops the oldest chunk when full.
#[derive(Debug)]
pub struct ReconnectBuffer {
    capacity: usize,
    chunks: VecDeque<Vec<u8>>,
    dropped: u64,
}

impl ReconnectBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chunks: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if self.chunks.len() >= self.capacity {
            self.chunks.pop_front();
            self.dropped += 1;
            warn!(
                capacity = self.capacity,
                dropped_total = self.dropped,
                "Reconnect buffer full, dropping oldest audio chunk"
            );
        }
        self.chunks.push_back(chunk);
    }

    fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Session-side handle to the transcriber task.
pub struct TranscriberHandle {
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl TranscriberHandle {
    /// Queue audio for the upstream. Returns false once the adapter has stopped.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        self.audio_tx.send(chunk.bytes).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.audio_tx.is_closed()
    }
}

impl Drop for TranscriberHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct StreamingTranscriber;

impl StreamingTranscriber {
    /// Spawn the adapter task. The first connection attempt starts immediately.
    pub fn open(
        connector: Arc<dyn TranscriberConnector>,
        options: SttOptions,
        retry: RetryPolicy,
        buffer_capacity: usize,
    ) -> (TranscriberHandle, mpsc::UnboundedReceiver<SttEvent>) {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let adapter = Adapter {
            connector,
            options,
            retry,
            audio_rx,
            events_tx,
            pending: ReconnectBuffer::new(buffer_capacity),
            cancel: cancel.clone(),
        };
        tokio::spawn(adapter.run());

        (TranscriberHandle { audio_tx, cancel }, events_rx)
    }
}

/// Uptime after which a silent link counts as healthy.
const STABLE_LINK: Duration = Duration::from_secs(5);

enum LinkExit {
    /// Session closed the transcriber.
    Closed,
    /// Upstream failed; reconnect. `healthy` is false when the link dropped
    /// before delivering any event or staying up for [`STABLE_LINK`].
    Dropped { reason: String, healthy: bool },
}

struct Adapter {
    connector: Arc<dyn TranscriberConnector>,
    options: SttOptions,
    retry: RetryPolicy,
    audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events_tx: mpsc::UnboundedSender<SttEvent>,
    pending: ReconnectBuffer,
    cancel: CancellationToken,
}

impl Adapter {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            let connected = match self.connect().await {
                Some(result) => result,
                None => break,
            };

            match connected {
                Ok(link) => {
                    info!(model = %self.options.model, buffered = self.pending.len(), "Transcriber connected");
                    self.emit(SttEvent::Ready);
                    match self.pump(link).await {
                        LinkExit::Closed => break,
                        LinkExit::Dropped { reason, healthy } => {
                            // Only a link that worked ends the failure streak.
                            failures = if healthy { 1 } else { failures + 1 };
                            warn!(%reason, attempt = failures, healthy, "Transcriber connection lost");
                            self.emit(SttEvent::Error {
                                message: format!("transcriber connection lost: {reason}"),
                                fatal: false,
                            });
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "Transcriber connect failed");
                    self.emit(SttEvent::Error {
                        message: format!("transcriber connect failed: {e}"),
                        fatal: false,
                    });
                }
            }

            let Some(delay) = self.retry.delay_for(failures) else {
                warn!(attempts = failures, "Transcriber retries exhausted");
                self.emit(SttEvent::Error {
                    message: "speech recognition unavailable; text input still works".into(),
                    fatal: true,
                });
                break;
            };
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnecting transcriber");
            if !self.wait(delay).await {
                break;
            }
        }
        self.emit(SttEvent::Closed);
    }

    fn emit(&self, event: SttEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Buffer audio received while disconnected. Returns false when the handle is gone.
    fn absorb(&mut self, input: Option<Vec<u8>>) -> bool {
        match input {
            Some(chunk) => {
                self.pending.push(chunk);
                true
            }
            None => false,
        }
    }

    async fn connect(&mut self) -> Option<Result<TranscriberLink>> {
        let connector = self.connector.clone();
        let options = self.options.clone();
        let limit = options.connect_timeout;
        let attempt = async {
            match tokio::time::timeout(limit, connector.connect(&options)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "connect timed out after {}ms",
                    limit.as_millis()
                )),
            }
        };
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = &mut attempt => return Some(result),
                input = self.audio_rx.recv() => {
                    if !self.absorb(input) {
                        return None;
                    }
                }
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                input = self.audio_rx.recv() => {
                    if !self.absorb(input) {
                        return false;
                    }
                }
            }
        }
    }

    async fn pump(&mut self, link: TranscriberLink) -> LinkExit {
        let TranscriberLink { audio, mut events } = link;
        let connected_at = tokio::time::Instant::now();
        let mut heard = false;
        let dropped = |reason: &str, heard: bool| LinkExit::Dropped {
            reason: reason.to_string(),
            healthy: heard || connected_at.elapsed() >= STABLE_LINK,
        };

        // Buffered audio goes out first; new audio queues behind it while the
        // upstream is backed up, so neither cancel nor events wait on a send.
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkExit::Closed,
                permit = audio.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(chunk) = self.pending.pop_front() {
                            permit.send(chunk);
                        }
                    }
                    Err(_) => return dropped("upstream closed while flushing buffer", heard),
                },
                input = self.audio_rx.recv() => match input {
                    Some(chunk) if self.pending.is_empty() => match audio.try_send(chunk) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(chunk)) => {
                            debug!("Upstream backed up, buffering audio");
                            self.pending.push(chunk);
                        }
                        Err(mpsc::error::TrySendError::Closed(chunk)) => {
                            self.pending.push(chunk);
                            return dropped("upstream stopped accepting audio", heard);
                        }
                    },
                    Some(chunk) => self.pending.push(chunk),
                    None => return LinkExit::Closed,
                },
                event = events.recv() => {
                    match event {
                        Some(Ok(UpstreamEvent::Transcript(t))) => self.emit(SttEvent::Transcript(t)),
                        Some(Ok(UpstreamEvent::SpeechStarted)) => self.emit(SttEvent::SpeechStarted),
                        Some(Ok(UpstreamEvent::UtteranceEnd)) => self.emit(SttEvent::UtteranceEnd),
                        Some(Err(e)) => return dropped(&e.to_string(), heard),
                        None => return dropped("upstream closed", heard),
                    }
                    heard = true;
                },
            }
        }
    }
}

// --- Deepgram live ---

const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Deepgram live transcription over WebSocket.
pub struct DeepgramConnector {
    api_key: String,
    endpoint: String,
}

impl DeepgramConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEEPGRAM_LISTEN_URL.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn listen_url(&self, options: &SttOptions) -> String {
        format!(
            "{}?model={}&language={}&encoding=linear16&sample_rate={}&channels=1\
             &interim_results=true&punctuate=true&smart_format=true&vad_events=true\
             &utterance_end_ms={}",
            self.endpoint,
            options.model,
            options.language,
            options.sample_rate,
            options.utterance_end_ms
        )
    }
}

#[async_trait]
impl TranscriberConnector for DeepgramConnector {
    async fn connect(&self, options: &SttOptions) -> Result<TranscriberLink> {
        let mut request = self.listen_url(options).into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))?,
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = ws.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel::<Result<UpstreamEvent>>(64);

        // Writer: audio out, keepalive when idle, CloseStream when the sender drops.
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    chunk = audio_rx.recv() => match chunk {
                        Some(bytes) => {
                            if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                            keepalive.reset();
                        }
                        None => {
                            let close = serde_json::json!({"type": "CloseStream"});
                            let _ = sink.send(WsMessage::Text(close.to_string().into())).await;
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        let ping = serde_json::json!({"type": "KeepAlive"});
                        if sink.send(WsMessage::Text(ping.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Deepgram writer finished");
        });

        // Reader: parse JSON results into upstream events.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let outcome = match frame {
                    Ok(WsMessage::Text(text)) => match parse_deepgram_message(&text) {
                        Ok(Some(event)) => Ok(event),
                        Ok(None) => continue,
                        Err(e) => {
                            debug!(error = %e, "Ignoring unparseable Deepgram message");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        Err(anyhow::anyhow!("upstream closed: {frame:?}"))
                    }
                    Ok(_) => continue,
                    Err(e) => Err(e.into()),
                };
                let stop = outcome.is_err();
                if event_tx.send(outcome).await.is_err() || stop {
                    break;
                }
            }
        });

        Ok(TranscriberLink {
            audio: audio_tx,
            events: event_rx,
        })
    }
}

/// Parse one Deepgram JSON message. `Ok(None)` for messages with no session meaning.
pub fn parse_deepgram_message(text: &str) -> Result<Option<UpstreamEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let event = match value["type"].as_str() {
        Some("Results") => {
            let alt = &value["channel"]["alternatives"][0];
            let transcript = alt["transcript"].as_str().unwrap_or_default();
            if transcript.trim().is_empty() {
                return Ok(None);
            }
            let confidence = alt["confidence"].as_f64().unwrap_or(0.0);
            let is_final = value["is_final"].as_bool().unwrap_or(false);
            Some(UpstreamEvent::Transcript(TranscriptEvent::new(
                transcript, is_final, confidence,
            )))
        }
        Some("SpeechStarted") => Some(UpstreamEvent::SpeechStarted),
        Some("UtteranceEnd") => Some(UpstreamEvent::UtteranceEnd),
        Some("Metadata") => None,
        Some(other) => {
            debug!(kind = other, "Unhandled Deepgram message");
            None
        }
        None => anyhow::bail!("message has no type"),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_exponential_policy_caps_delay() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 6,
            delay_ms: 500,
            backoff: "exponential".into(),
            max_delay_ms: Some(4_000),
        });
        let delays: Vec<u64> = (1..=6)
            .map(|n| policy.delay_for(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 4_000, 4_000]);
        assert_eq!(policy.delay_for(7), None);
    }

    #[test]
    fn test_reconnect_buffer_drops_oldest() {
        let mut buffer = ReconnectBuffer::new(3);
        for i in 0..5u8 {
            buffer.push(vec![i]);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.pop_front(), Some(vec![2]));
        assert_eq!(buffer.pop_front(), Some(vec![3]));
        assert_eq!(buffer.pop_front(), Some(vec![4]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_listen_url() {
        let url = DeepgramConnector::new("k").listen_url(&SttOptions::default());
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?model=nova-2"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("interim_results=true"));
        assert!(url.contains("vad_events=true"));
        assert!(url.contains("utterance_end_ms=1000"));
    }

    #[test]
    fn test_parse_deepgram_results() {
        let msg = r#"{"type":"Results","is_final":true,"speech_final":true,
            "channel":{"alternatives":[{"transcript":"hello there","confidence":0.97}]}}"#;
        match parse_deepgram_message(msg).unwrap() {
            Some(UpstreamEvent::Transcript(t)) => {
                assert_eq!(t.text, "hello there");
                assert!(t.is_final);
                assert!((t.confidence - 0.97).abs() < 1e-9);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let empty = r#"{"type":"Results","is_final":false,"channel":{"alternatives":[{"transcript":"","confidence":0}]}}"#;
        assert_eq!(parse_deepgram_message(empty).unwrap(), None);
        assert_eq!(
            parse_deepgram_message(r#"{"type":"UtteranceEnd"}"#).unwrap(),
            Some(UpstreamEvent::UtteranceEnd)
        );
        assert_eq!(parse_deepgram_message(r#"{"type":"Metadata"}"#).unwrap(), None);
        assert!(parse_deepgram_message("{}").is_err());
    }

    /// Scripted connector: each connect pops the next outcome.
    struct ScriptedConnector {
        script: Mutex<VecDeque<ScriptStep>>,
        upstreams: Mutex<Vec<MockUpstream>>,
    }

    enum ScriptStep {
        Fail,
        Connect,
    }

    struct MockUpstream {
        audio: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Sender<Result<UpstreamEvent>>,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                upstreams: Mutex::new(Vec::new()),
            })
        }

        fn take_upstream(&self) -> MockUpstream {
            self.upstreams.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl TranscriberConnector for ScriptedConnector {
        async fn connect(&self, _options: &SttOptions) -> Result<TranscriberLink> {
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(ScriptStep::Connect) => {
                    let (audio_tx, audio_rx) = mpsc::channel(16);
                    let (event_tx, event_rx) = mpsc::channel(16);
                    self.upstreams.lock().unwrap().push(MockUpstream {
                        audio: audio_rx,
                        events: event_tx,
                    });
                    Ok(TranscriberLink {
                        audio: audio_tx,
                        events: event_rx,
                    })
                }
                _ => anyhow::bail!("connection refused"),
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            backoff: Backoff::Fixed,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SttEvent>) -> SttEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for stt event")
            .expect("stt channel closed")
    }

    #[tokio::test]
    async fn test_forwards_audio_and_transcripts() {
        let connector = ScriptedConnector::new(vec![ScriptStep::Connect]);
        let (handle, mut events) =
            StreamingTranscriber::open(connector.clone(), SttOptions::default(), fast_retry(1), 10);

        assert_eq!(next_event(&mut events).await, SttEvent::Ready);
        let mut upstream = connector.take_upstream();

        assert!(handle.push(AudioChunk::new(vec![1, 2])));
        assert_eq!(upstream.audio.recv().await, Some(vec![1, 2]));

        let t = TranscriptEvent::new("hi", true, 0.9);
        upstream
            .events
            .send(Ok(UpstreamEvent::Transcript(t.clone())))
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, SttEvent::Transcript(t));

        handle.close();
        assert_eq!(next_event(&mut events).await, SttEvent::Closed);
        // Upstream sees its audio sender dropped.
        assert_eq!(upstream.audio.recv().await, None);
    }

    #[tokio::test]
    async fn test_reconnects_and_flushes_buffer_in_order() {
        let connector = ScriptedConnector::new(vec![
            ScriptStep::Connect,
            ScriptStep::Fail,
            ScriptStep::Connect,
        ]);
        let (handle, mut events) =
            StreamingTranscriber::open(connector.clone(), SttOptions::default(), fast_retry(3), 10);
        assert_eq!(next_event(&mut events).await, SttEvent::Ready);

        // Upstream drops.
        let first = connector.take_upstream();
        first
            .events
            .send(Err(anyhow::anyhow!("socket reset")))
            .await
            .unwrap();
        match next_event(&mut events).await {
            SttEvent::Error { fatal, message } => {
                assert!(!fatal);
                assert!(message.contains("socket reset"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Audio pushed during the outage is buffered.
        handle.push(AudioChunk::new(vec![10]));
        handle.push(AudioChunk::new(vec![11]));

        // One failed attempt, then reconnected.
        assert!(matches!(
            next_event(&mut events).await,
            SttEvent::Error { fatal: false, .. }
        ));
        assert_eq!(next_event(&mut events).await, SttEvent::Ready);

        let mut second = connector.take_upstream();
        assert_eq!(second.audio.recv().await, Some(vec![10]));
        assert_eq!(second.audio.recv().await, Some(vec![11]));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let connector = ScriptedConnector::new(vec![]);
        let (_handle, mut events) =
            StreamingTranscriber::open(connector, SttOptions::default(), fast_retry(2), 10);

        let mut non_fatal = 0;
        loop {
            match next_event(&mut events).await {
                SttEvent::Error { fatal: false, .. } => non_fatal += 1,
                SttEvent::Error { fatal: true, .. } => break,
                other => panic!("unexpected: {other:?}"),
            }
        }
        // Initial attempt plus two retries.
        assert_eq!(non_fatal, 3);
        assert_eq!(next_event(&mut events).await, SttEvent::Closed);
    }

    /// Accepts every connection, then closes it before sending anything.
    #[derive(Default)]
    struct FlappingConnector {
        connects: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl TranscriberConnector for FlappingConnector {
        async fn connect(&self, _options: &SttOptions) -> Result<TranscriberLink> {
            self.connects
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let (audio_tx, _audio_rx) = mpsc::channel(4);
            let (_event_tx, event_rx) = mpsc::channel(4);
            Ok(TranscriberLink {
                audio: audio_tx,
                events: event_rx,
            })
        }
    }

    #[tokio::test]
    async fn test_flapping_upstream_exhausts_retries() {
        let connector = Arc::new(FlappingConnector::default());
        let (_handle, mut events) =
            StreamingTranscriber::open(connector.clone(), SttOptions::default(), fast_retry(2), 10);

        let mut readies = 0;
        loop {
            match next_event(&mut events).await {
                SttEvent::Ready => readies += 1,
                SttEvent::Error { fatal: false, .. } => {}
                SttEvent::Error { fatal: true, message } => {
                    assert!(message.contains("unavailable"));
                    break;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(readies, 3);
        assert_eq!(
            connector
                .connects
                .load(std::sync::atomic::Ordering::SeqCst),
            3
        );
        assert_eq!(next_event(&mut events).await, SttEvent::Closed);
    }

    #[tokio::test]
    async fn test_link_that_delivered_events_resets_failures() {
        let connector = ScriptedConnector::new(vec![
            ScriptStep::Connect,
            ScriptStep::Connect,
            ScriptStep::Connect,
        ]);
        let (_handle, mut events) =
            StreamingTranscriber::open(connector.clone(), SttOptions::default(), fast_retry(1), 10);

        // Two links that each worked before dropping; one retry allowed per streak.
        for _ in 0..2 {
            assert_eq!(next_event(&mut events).await, SttEvent::Ready);
            let upstream = connector.take_upstream();
            upstream
                .events
                .send(Ok(UpstreamEvent::SpeechStarted))
                .await
                .unwrap();
            assert_eq!(next_event(&mut events).await, SttEvent::SpeechStarted);
            drop(upstream);
            assert!(matches!(
                next_event(&mut events).await,
                SttEvent::Error { fatal: false, .. }
            ));
        }
        assert_eq!(next_event(&mut events).await, SttEvent::Ready);
    }

    /// Never completes a connection.
    struct HangingConnector;

    #[async_trait]
    impl TranscriberConnector for HangingConnector {
        async fn connect(&self, _options: &SttOptions) -> Result<TranscriberLink> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failed_attempt() {
        let options = SttOptions {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (_handle, mut events) =
            StreamingTranscriber::open(Arc::new(HangingConnector), options, fast_retry(1), 10);

        match next_event(&mut events).await {
            SttEvent::Error { fatal, message } => {
                assert!(!fatal);
                assert!(message.contains("timed out after 50ms"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            next_event(&mut events).await,
            SttEvent::Error { fatal: false, .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SttEvent::Error { fatal: true, .. }
        ));
        assert_eq!(next_event(&mut events).await, SttEvent::Closed);
    }

    #[test]
    fn test_connect_timeout_from_config() {
        let config = SttConfig {
            connect_timeout_ms: Some(2_500),
            ..Default::default()
        };
        let options = SttOptions::from_config(&config);
        assert_eq!(options.connect_timeout, Duration::from_millis(2_500));
        assert_eq!(
            SttOptions::from_config(&SttConfig::default()).connect_timeout,
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_backed_up_upstream_keeps_events_and_close_flowing() {
        let connector = ScriptedConnector::new(vec![ScriptStep::Connect]);
        let (handle, mut events) =
            StreamingTranscriber::open(connector.clone(), SttOptions::default(), fast_retry(1), 100);
        assert_eq!(next_event(&mut events).await, SttEvent::Ready);
        let mut upstream = connector.take_upstream();

        // More audio than the upstream channel holds, and nobody reading it.
        for i in 0..40u8 {
            assert!(handle.push(AudioChunk::new(vec![i])));
        }
        let t = TranscriptEvent::new("still listening", false, 0.5);
        upstream
            .events
            .send(Ok(UpstreamEvent::Transcript(t.clone())))
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, SttEvent::Transcript(t));

        // Audio that did get through is in order.
        assert_eq!(upstream.audio.recv().await, Some(vec![0]));
        assert_eq!(upstream.audio.recv().await, Some(vec![1]));

        handle.close();
        assert_eq!(next_event(&mut events).await, SttEvent::Closed);
    }
}
