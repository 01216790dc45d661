//! Gateway integration tests: start a real gateway and talk to it over WS + HTTP.
//!
//! Transcriber, model, and synthesizer are in-process fakes.
//! Run with: `cargo test -p parley-gateway --test integration`

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use parley_agent::{GeneratorSettings, ResponseGenerator};
use parley_core::config::Config;
use parley_core::store::{JsonBotStore, JsonlConversationSink};
use parley_core::types::TranscriptEvent;
use parley_gateway::{GatewayState, SessionSettings};
use parley_media::stt::{
    Backoff, RetryPolicy, SttOptions, TranscriberConnector, TranscriberLink, UpstreamEvent,
};
use parley_media::tts::{AudioEncoding, SpeechSynthesizer, SynthesizedAudio};
use parley_providers::{
    CompletionChunk, CompletionRequest, CompletionStream, Credentials, LlmProvider,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Fakes ---

/// Replies "echo: <last user text>".
struct EchoModel;

#[async_trait]
impl LlmProvider for EchoModel {
    fn id(&self) -> &str {
        "echo"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let chunk = CompletionChunk {
            delta: Some(format!("echo: {last}")),
            ..Default::default()
        };
        Ok(Box::pin(futures::stream::iter(vec![Ok::<_, anyhow::Error>(
            chunk,
        )])))
    }
}

/// Linear16 audio of `audio` length, produced after `delay`.
struct FakeVoice {
    delay: Duration,
    audio: Duration,
}

#[async_trait]
impl SpeechSynthesizer for FakeVoice {
    async fn synthesize(&self, _text: &str, _voice: &str) -> anyhow::Result<SynthesizedAudio> {
        tokio::time::sleep(self.delay).await;
        let samples = (24_000.0 * self.audio.as_secs_f64()) as usize;
        Ok(SynthesizedAudio {
            bytes: vec![0u8; samples * 2],
            format: AudioEncoding::Linear16,
            sample_rate: 24_000,
        })
    }
}

#[derive(Clone, Copy)]
enum Upstream {
    /// Every audio chunk yields one final transcript.
    Healthy,
    /// Like `Healthy`, but recognition confidence stays below the threshold.
    Mumbling,
    /// First connection closes at once; later ones are healthy.
    DropsFirst,
    /// Every connection attempt fails.
    Down,
}

struct FakeTranscriber {
    mode: Upstream,
    connects: AtomicU32,
}

impl FakeTranscriber {
    fn new(mode: Upstream) -> Arc<Self> {
        Arc::new(Self {
            mode,
            connects: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TranscriberConnector for FakeTranscriber {
    async fn connect(&self, _options: &SttOptions) -> anyhow::Result<TranscriberLink> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (events_tx, events_rx) = mpsc::channel(64);

        match self.mode {
            Upstream::Down => anyhow::bail!("connection refused"),
            Upstream::DropsFirst if attempt == 1 => {
                drop(events_tx);
            }
            mode => {
                let confidence = match mode {
                    Upstream::Mumbling => 0.3,
                    _ => 0.92,
                };
                tokio::spawn(async move {
                    while audio_rx.recv().await.is_some() {
                        let transcript =
                            TranscriptEvent::new("turn on the lights", true, confidence);
                        if events_tx
                            .send(Ok(UpstreamEvent::Transcript(transcript)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        }

        Ok(TranscriberLink {
            audio: audio_tx,
            events: events_rx,
        })
    }
}

// --- Harness ---

struct TestGateway {
    port: u16,
    dir: tempfile::TempDir,
}

async fn start_test_gateway(upstream: Upstream, voice: FakeVoice) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let bots = json!([
        {"id": "ava", "name": "Ava", "persona": "A cheerful assistant.", "owner": "u1"},
        {"id": "private", "name": "Max", "owner": "someone-else"}
    ]);
    std::fs::write(dir.path().join("bots.json"), bots.to_string()).unwrap();

    let generator = ResponseGenerator::new(
        Arc::new(EchoModel),
        Credentials::ApiKey {
            api_key: "test".into(),
        },
        GeneratorSettings::default(),
    );
    let settings = SessionSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(20),
            backoff: Backoff::Fixed,
        },
        ..Default::default()
    };

    let state = GatewayState::new(
        Arc::new(Config::default()),
        Arc::new(JsonBotStore::new(dir.path().to_path_buf())),
        Arc::new(JsonlConversationSink::new(dir.path().to_path_buf())),
    )
    .with_generator(generator)
    .with_synthesizer(Arc::new(voice))
    .with_transcriber(FakeTranscriber::new(upstream))
    .with_settings(settings);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(parley_gateway::serve(listener, Arc::new(state)));

    TestGateway { port, dir }
}

fn quick_voice() -> FakeVoice {
    FakeVoice {
        delay: Duration::ZERO,
        audio: Duration::from_millis(100),
    }
}

async fn connect(port: u16) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");
    let ready = recv(&mut ws).await;
    assert_eq!(ready["type"], "connection_ready");
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read until a frame of type `wanted`; returns the types seen on the way, plus the frame.
async fn recv_until(ws: &mut Ws, wanted: &str) -> (Vec<String>, Value) {
    let mut seen = Vec::new();
    loop {
        let frame = recv(ws).await;
        let kind = frame["type"].as_str().unwrap_or_default().to_string();
        if kind == wanted {
            return (seen, frame);
        }
        seen.push(kind);
    }
}

/// Every frame that arrives within `window`.
async fn drain_for(ws: &mut Ws, window: Duration) -> Vec<Value> {
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, ws.next()).await {
        if let Message::Text(text) = msg {
            frames.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    frames
}

async fn start_session(ws: &mut Ws) -> Value {
    send(ws, json!({"type": "start_session", "botId": "ava", "userId": "u1"})).await;
    recv_until(ws, "session_started").await.1
}

fn silence_chunk() -> String {
    base64::engine::general_purpose::STANDARD.encode(vec![0u8; 640])
}

// --- HTTP ---

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", gw.port))
        .await
        .expect("Health request failed");
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert_eq!(body["services"]["deepgram"], true);
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn test_environment_endpoint() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;

    let body: Value = reqwest::get(format!(
        "http://127.0.0.1:{}/api/environment/validate",
        gw.port
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert!(body["valid"].is_boolean());
    assert!(body["missing_keys"].is_array());
    assert!(body["recommendations"].is_array());
}

// --- Sessions ---

#[tokio::test]
async fn test_session_start_reports_bot_name() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;
    let mut ws = connect(gw.port).await;

    let started = start_session(&mut ws).await;
    assert_eq!(started["botName"], "Ava");
    assert!(started["sessionId"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(started["timestamp"].is_string());

    recv_until(&mut ws, "stt_ready").await;
}

#[tokio::test]
async fn test_foreign_bot_is_refused() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;
    let mut ws = connect(gw.port).await;

    send(
        &mut ws,
        json!({"type": "start_session", "botId": "private", "userId": "u1"}),
    )
    .await;
    let error = recv(&mut ws).await;
    assert_eq!(error["type"], "processing_error");
    assert_eq!(recv(&mut ws).await["type"], "session_ended");
}

#[tokio::test]
async fn test_malformed_message_keeps_connection() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;

    send(&mut ws, json!({"type": "dance"})).await;
    let (_, error) = recv_until(&mut ws, "processing_error").await;
    assert!(error["message"].as_str().unwrap().contains("invalid message"));

    send(&mut ws, json!({"type": "text_message", "text": "still there?"})).await;
    let (_, reply) = recv_until(&mut ws, "ai_response").await;
    assert_eq!(reply["content"], "echo: still there?");
}

#[tokio::test]
async fn test_spoken_turn_orders_events() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;
    recv_until(&mut ws, "stt_ready").await;

    send(
        &mut ws,
        json!({"type": "audio_chunk", "audio": silence_chunk(), "timestamp": 1}),
    )
    .await;

    let (seen, user) = recv_until(&mut ws, "user_message").await;
    assert!(seen.contains(&"transcript".to_string()));
    assert_eq!(user["content"], "turn on the lights");

    let (seen, reply) = recv_until(&mut ws, "ai_response").await;
    assert!(!seen.contains(&"audio_response".to_string()));
    assert_eq!(reply["content"], "echo: turn on the lights");

    let (_, audio) = recv_until(&mut ws, "audio_response").await;
    assert_eq!(audio["format"], "linear16");
    assert_eq!(audio["text"], "echo: turn on the lights");
    assert!(!audio["audio"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_low_confidence_transcript_is_feedback_only() {
    let gw = start_test_gateway(Upstream::Mumbling, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;
    recv_until(&mut ws, "stt_ready").await;

    send(&mut ws, json!({"type": "audio_chunk", "audio": silence_chunk()})).await;
    let (_, transcript) = recv_until(&mut ws, "transcript").await;
    assert_eq!(transcript["transcript"], "turn on the lights");
    assert_eq!(transcript["is_final"], true);
    assert!((transcript["confidence"].as_f64().unwrap() - 0.3).abs() < 1e-9);

    let later = drain_for(&mut ws, Duration::from_millis(500)).await;
    assert!(
        later
            .iter()
            .all(|f| f["type"] != "user_message" && f["type"] != "ai_response"),
        "low-confidence speech started a turn: {later:?}"
    );
}

#[tokio::test]
async fn test_interrupt_cancels_pending_audio() {
    let voice = FakeVoice {
        delay: Duration::from_millis(300),
        audio: Duration::from_millis(100),
    };
    let gw = start_test_gateway(Upstream::Healthy, voice).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;

    send(&mut ws, json!({"type": "text_message", "text": "tell me a story"})).await;
    recv_until(&mut ws, "ai_response").await;

    // Synthesis is still running.
    send(&mut ws, json!({"type": "interrupt"})).await;
    recv_until(&mut ws, "interrupted").await;

    let late = drain_for(&mut ws, Duration::from_millis(700)).await;
    assert!(
        late.iter().all(|f| f["type"] != "audio_response"),
        "audio from the interrupted turn was delivered: {late:?}"
    );

    // The next turn plays normally.
    send(&mut ws, json!({"type": "text_message", "text": "never mind"})).await;
    let (_, audio) = recv_until(&mut ws, "audio_response").await;
    assert_eq!(audio["text"], "echo: never mind");
}

#[tokio::test]
async fn test_interrupt_during_playback() {
    let voice = FakeVoice {
        delay: Duration::ZERO,
        audio: Duration::from_secs(2),
    };
    let gw = start_test_gateway(Upstream::Healthy, voice).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;

    send(&mut ws, json!({"type": "text_message", "text": "first"})).await;
    send(&mut ws, json!({"type": "text_message", "text": "second"})).await;
    recv_until(&mut ws, "audio_response").await;

    send(&mut ws, json!({"type": "interrupt"})).await;
    recv_until(&mut ws, "interrupted").await;

    let late = drain_for(&mut ws, Duration::from_millis(500)).await;
    assert!(late.iter().all(|f| f["type"] != "audio_response"));
}

#[tokio::test]
async fn test_transcriber_reconnects_after_drop() {
    let gw = start_test_gateway(Upstream::DropsFirst, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;

    recv_until(&mut ws, "stt_ready").await;
    recv_until(&mut ws, "stt_error").await;
    recv_until(&mut ws, "stt_ready").await;

    // Speech works on the new connection.
    send(&mut ws, json!({"type": "audio_chunk", "audio": silence_chunk()})).await;
    let (_, user) = recv_until(&mut ws, "user_message").await;
    assert_eq!(user["content"], "turn on the lights");
}

#[tokio::test]
async fn test_transcriber_gives_up_but_text_works() {
    let gw = start_test_gateway(Upstream::Down, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;

    loop {
        let (_, error) = recv_until(&mut ws, "stt_error").await;
        if error["message"].as_str().unwrap().contains("unavailable") {
            break;
        }
    }

    send(&mut ws, json!({"type": "text_message", "text": "typing instead"})).await;
    let (_, reply) = recv_until(&mut ws, "ai_response").await;
    assert_eq!(reply["content"], "echo: typing instead");
}

#[tokio::test]
async fn test_stop_session_persists_once() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    let started = start_session(&mut ws).await;

    send(&mut ws, json!({"type": "text_message", "text": "hello"})).await;
    recv_until(&mut ws, "ai_response").await;

    send(&mut ws, json!({"type": "stop_session"})).await;
    recv_until(&mut ws, "session_ended").await;
    // A second stop is a no-op.
    send(&mut ws, json!({"type": "stop_session"})).await;
    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sink = JsonlConversationSink::new(gw.dir.path().to_path_buf());
    let records = sink.load_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, started["sessionId"].as_str().unwrap());
    assert_eq!(records[0].bot_id, "ava");
    let contents: Vec<_> = records[0]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["hello", "echo: hello"]);
}

#[tokio::test]
async fn test_disconnect_persists_conversation() {
    let gw = start_test_gateway(Upstream::Healthy, quick_voice()).await;
    let mut ws = connect(gw.port).await;
    start_session(&mut ws).await;

    send(&mut ws, json!({"type": "text_message", "text": "bye"})).await;
    recv_until(&mut ws, "ai_response").await;
    drop(ws);

    let sink = JsonlConversationSink::new(gw.dir.path().to_path_buf());
    let mut records = Vec::new();
    for _ in 0..50 {
        records = sink.load_all().await.unwrap();
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].messages.len(), 2);
}
