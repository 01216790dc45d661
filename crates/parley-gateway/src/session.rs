//! Session controller: one actor per connection.
//!
//! Client commands, transcriber events, generation and synthesis results, and
//! playback progress all arrive at one loop, so session state is only touched
//! from a single task. Every reply carries a turn id. An interrupt raises the
//! turn floor; anything tagged below it is discarded when it arrives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use parley_agent::{GenerationOutcome, ResponseGenerator};
use parley_core::config::{Config, GatewayAuthConfig, OverlapPolicy};
use parley_core::error::ParleyError;
use parley_core::protocol::{ClientMessage, ServerEvent};
use parley_core::session::{Conversation, ConversationRecord, Message, Session, SessionStatus};
use parley_core::store::{BotStore, ConversationSink};
use parley_core::types::{AudioChunk, BotConfig, TranscriptEvent};
use parley_media::playback::{PlaybackEvent, PlaybackItem, PlaybackQueue, Player};
use parley_media::stt::{
    RetryPolicy, StreamingTranscriber, SttEvent, SttOptions, TranscriberConnector,
    TranscriberHandle,
};
use parley_media::tts::{SpeechSynthesizer, SynthesizedAudio};
use parley_media::vad::{VadTransition, VoiceActivityDetector};

use crate::auth::authenticate;
use crate::metrics::MetricsCollector;
use crate::turn::{TurnAction, TurnCoordinator, TurnInput};

const COMMAND_BUFFER: usize = 256;

/// Input to a session from its connection.
#[derive(Debug)]
pub enum SessionCommand {
    Start {
        bot_id: String,
        user_id: String,
        auth_token: Option<String>,
    },
    Audio(AudioChunk),
    Text(String),
    Interrupt,
    Stop,
}

impl TryFrom<ClientMessage> for SessionCommand {
    type Error = ParleyError;

    fn try_from(msg: ClientMessage) -> Result<Self, Self::Error> {
        Ok(match msg {
            ClientMessage::StartSession {
                bot_id,
                user_id,
                auth_token,
            } => Self::Start {
                bot_id,
                user_id,
                auth_token,
            },
            ClientMessage::AudioChunk { audio, .. } => Self::Audio(AudioChunk::from_base64(&audio)?),
            ClientMessage::TextMessage { text } => Self::Text(text),
            ClientMessage::Interrupt => Self::Interrupt,
            ClientMessage::StopSession => Self::Stop,
        })
    }
}

/// Tunables for one session, resolved from config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub auth: Option<GatewayAuthConfig>,
    pub confidence_threshold: f64,
    pub overlap_policy: OverlapPolicy,
    pub history_window: usize,
    pub vad_threshold: f64,
    pub vad_hangover_frames: usize,
    pub stt: SttOptions,
    pub retry: RetryPolicy,
    pub reconnect_buffer_chunks: usize,
    pub default_voice: String,
    pub synthesis_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let stt = config.stt();
        Self {
            auth: config.gateway.as_ref().and_then(|g| g.auth.clone()),
            confidence_threshold: config.confidence_threshold(),
            overlap_policy: config.overlap_policy(),
            history_window: config.history_window(),
            vad_threshold: config.vad_threshold(),
            vad_hangover_frames: config.vad_hangover_frames(),
            stt: SttOptions::from_config(&stt),
            retry: stt
                .retry
                .as_ref()
                .map(RetryPolicy::from_config)
                .unwrap_or_default(),
            reconnect_buffer_chunks: stt.reconnect_buffer_chunks.unwrap_or(50),
            default_voice: config.tts().voice().to_string(),
            synthesis_timeout: Duration::from_millis(config.synthesis_timeout_ms()),
        }
    }
}

/// Shared services a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub bots: Arc<dyn BotStore>,
    pub conversations: Arc<dyn ConversationSink>,
    pub generator: Option<Arc<ResponseGenerator>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub transcriber: Option<Arc<dyn TranscriberConnector>>,
    pub metrics: Arc<MetricsCollector>,
    pub settings: SessionSettings,
}

/// Connection-side handle to a running session actor.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Returns false once the actor has exited.
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Close the command channel and wait for the actor to finish. A session
    /// still active at this point is ended as if the client had stopped it.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            error!(error = %e, "Session task failed");
        }
    }
}

pub struct SessionController;

impl SessionController {
    /// Spawn the session actor. Outbound frames are JSON strings for the client.
    pub fn spawn(
        conn_id: &str,
        deps: SessionDeps,
        outbound: mpsc::UnboundedSender<String>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let player = Arc::new(GatewayPlayer {
            deliver: internal_tx.clone(),
        });
        let settings = &deps.settings;
        let vad = VoiceActivityDetector::new(
            settings.vad_threshold,
            settings.vad_hangover_frames,
            settings.stt.sample_rate,
        );

        let actor = SessionActor {
            out: Outbound(outbound),
            internal_tx,
            active: None,
            ended: false,
            coordinator: TurnCoordinator::new(),
            vad,
            transcriber: None,
            stt_events: None,
            stt_degraded: false,
            playback: PlaybackQueue::spawn(player, playback_tx),
            turn: 0,
            floor: 0,
            turn_cancel: CancellationToken::new(),
            generating: None,
            pending: None,
            synthesizing: None,
            synth_backlog: VecDeque::new(),
            deps,
        };

        let span = info_span!("session", conn_id = %conn_id);
        let task = tokio::spawn(
            actor
                .run(commands_rx, internal_rx, playback_rx)
                .instrument(span),
        );

        SessionHandle {
            commands: commands_tx,
            task,
        }
    }
}

enum Internal {
    Generated {
        turn: u64,
        outcome: GenerationOutcome,
    },
    Synthesized {
        turn: u64,
        text: String,
        result: Result<SynthesizedAudio, String>,
    },
    /// The playback queue reached this item; send it to the client.
    Deliver(PlaybackItem),
}

/// Plays by handing audio back to the session for delivery, then holding
/// for the audio's duration so the queue tracks client playback.
struct GatewayPlayer {
    deliver: mpsc::UnboundedSender<Internal>,
}

#[async_trait]
impl Player for GatewayPlayer {
    async fn play(&self, item: &PlaybackItem) -> anyhow::Result<()> {
        self.deliver
            .send(Internal::Deliver(item.clone()))
            .map_err(|_| anyhow::anyhow!("session closed"))?;
        tokio::time::sleep(item.audio.duration(&item.text)).await;
        Ok(())
    }
}

struct Outbound(mpsc::UnboundedSender<String>);

impl Outbound {
    fn emit(&self, event: ServerEvent) {
        let name = event.name();
        match event.stamp().to_json() {
            Ok(json) => {
                if self.0.send(json).is_err() {
                    debug!(event = name, "Client gone, event dropped");
                }
            }
            Err(e) => error!(event = name, error = %e, "Failed to serialize event"),
        }
    }
}

struct Active {
    session: Session,
    bot: Arc<BotConfig>,
    conversation: Conversation,
}

struct SessionActor {
    deps: SessionDeps,
    out: Outbound,
    internal_tx: mpsc::UnboundedSender<Internal>,
    active: Option<Active>,
    ended: bool,
    coordinator: TurnCoordinator,
    vad: VoiceActivityDetector,
    transcriber: Option<TranscriberHandle>,
    stt_events: Option<mpsc::UnboundedReceiver<SttEvent>>,
    /// Set after a transcriber error, cleared on the next ready.
    stt_degraded: bool,
    playback: PlaybackQueue,
    /// Latest turn id handed out.
    turn: u64,
    /// Results for turns below this are stale.
    floor: u64,
    turn_cancel: CancellationToken,
    generating: Option<u64>,
    pending: Option<String>,
    synthesizing: Option<u64>,
    synth_backlog: VecDeque<(u64, String)>,
}

async fn next_stt(rx: &mut Option<mpsc::UnboundedReceiver<SttEvent>>) -> Option<SttEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Connection closed, ending session");
                        self.stop().await;
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                Some(event) = playback.recv() => self.handle_playback(event),
                event = next_stt(&mut self.stt_events) => match event {
                    Some(event) => self.handle_stt(event),
                    None => self.stt_events = None,
                },
            }
        }
        self.playback.shutdown();
        debug!("Session task finished");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start {
                bot_id,
                user_id,
                auth_token,
            } => self.start(bot_id, user_id, auth_token).await,
            SessionCommand::Stop if self.ended => debug!("Session already ended"),
            SessionCommand::Stop => self.stop().await,
            _ if self.active.is_none() => {
                self.out
                    .emit(ServerEvent::processing_error("no active session"));
            }
            SessionCommand::Audio(chunk) => self.handle_audio(chunk),
            SessionCommand::Text(text) => self.handle_utterance(text),
            SessionCommand::Interrupt => self.apply(TurnInput::Interrupt),
        }
    }

    async fn start(&mut self, bot_id: String, user_id: String, auth_token: Option<String>) {
        if self.active.is_some() {
            self.out
                .emit(ServerEvent::processing_error("session already started"));
            return;
        }
        if self.ended {
            self.out
                .emit(ServerEvent::processing_error("session already ended"));
            return;
        }

        let fetched = match authenticate(self.deps.settings.auth.as_ref(), auth_token.as_deref()) {
            Ok(()) => self.deps.bots.fetch(&bot_id, &user_id).await,
            Err(e) => Err(e),
        };
        let bot = match fetched {
            Ok(bot) => bot,
            Err(e) => {
                if e.is_fatal_at_start() {
                    warn!(%bot_id, %user_id, kind = e.kind(), error = %e, "Session start rejected");
                } else {
                    error!(%bot_id, %user_id, kind = e.kind(), error = %e, "Session start failed");
                }
                self.deps.metrics.record_error(e.kind());
                self.ended = true;
                self.out.emit(ServerEvent::processing_error(e.to_string()));
                self.out.emit(ServerEvent::SessionEnded);
                return;
            }
        };

        let mut session = Session::new(bot_id, user_id);
        session.status = SessionStatus::Active;
        info!(session_id = %session.id, bot = %bot.id, user = %session.user_id, "Session started");
        self.deps.metrics.session_started();
        self.out.emit(ServerEvent::SessionStarted {
            session_id: session.id.clone(),
            bot_name: bot.display_name().to_string(),
        });
        self.active = Some(Active {
            session,
            bot: Arc::new(bot),
            conversation: Conversation::new(),
        });
        self.open_transcriber();
    }

    fn open_transcriber(&mut self) {
        let Some(connector) = self.deps.transcriber.clone() else {
            info!("No transcriber configured, text input only");
            self.out.emit(ServerEvent::SttError {
                message: "speech recognition not configured; text input still works".into(),
            });
            return;
        };
        let settings = &self.deps.settings;
        let (handle, events) = StreamingTranscriber::open(
            connector,
            settings.stt.clone(),
            settings.retry.clone(),
            settings.reconnect_buffer_chunks,
        );
        self.transcriber = Some(handle);
        self.stt_events = Some(events);
    }

    fn handle_audio(&mut self, chunk: AudioChunk) {
        for transition in self.vad.push_pcm(&chunk.bytes) {
            let input = match transition {
                VadTransition::SpeechStarted => TurnInput::VoiceStart,
                VadTransition::SpeechEnded => TurnInput::VoiceEnd,
            };
            self.apply(input);
        }
        if let Some(stt) = &self.transcriber {
            if !stt.push(chunk) {
                debug!("Transcriber stopped, audio dropped");
            }
        }
    }

    fn handle_stt(&mut self, event: SttEvent) {
        match event {
            SttEvent::Ready => {
                if std::mem::take(&mut self.stt_degraded) {
                    info!("Transcriber recovered");
                    self.deps.metrics.stt_reconnect();
                }
                self.out.emit(ServerEvent::SttReady);
            }
            SttEvent::Transcript(transcript) => self.handle_transcript(transcript),
            SttEvent::SpeechStarted => self.apply(TurnInput::VoiceStart),
            SttEvent::UtteranceEnd => self.apply(TurnInput::VoiceEnd),
            SttEvent::Error { message, fatal } => {
                self.stt_degraded = true;
                self.deps.metrics.record_error("stt");
                if fatal {
                    error!(%message, "Transcriber unavailable");
                    self.transcriber = None;
                } else {
                    warn!(%message, "Transcriber error");
                }
                self.out.emit(ServerEvent::SttError { message });
            }
            SttEvent::Closed => {
                debug!("Transcriber closed");
                self.transcriber = None;
                self.stt_events = None;
            }
        }
    }

    fn handle_transcript(&mut self, transcript: TranscriptEvent) {
        if transcript.text.trim().is_empty() {
            return;
        }
        self.out.emit(ServerEvent::Transcript {
            transcript: transcript.text.clone(),
            confidence: transcript.confidence,
            is_final: transcript.is_final,
        });
        if transcript.advances_turn(self.deps.settings.confidence_threshold) {
            self.handle_utterance(transcript.text);
        } else if transcript.is_final {
            debug!(confidence = transcript.confidence, "Final transcript below threshold");
        }
    }

    /// A user utterance from a final transcript or a text message.
    fn handle_utterance(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.generating.is_some() {
            match self.deps.settings.overlap_policy {
                OverlapPolicy::Drop => {
                    warn!(utterance = %text, "Reply in progress, utterance dropped");
                    self.out.emit(ServerEvent::processing_error(
                        "still responding to the previous message",
                    ));
                }
                OverlapPolicy::QueueLatest => {
                    if let Some(replaced) = self.pending.replace(text) {
                        debug!(%replaced, "Pending utterance superseded");
                    }
                }
            }
            return;
        }
        self.start_generation(text);
    }

    fn start_generation(&mut self, text: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let history = active
            .conversation
            .recent(self.deps.settings.history_window)
            .to_vec();
        active.conversation.push(Message::user(text.clone()));
        self.out.emit(ServerEvent::UserMessage {
            content: text.clone(),
        });

        let Some(generator) = self.deps.generator.clone() else {
            warn!("No language model configured");
            self.out
                .emit(ServerEvent::processing_error("language model not configured"));
            return;
        };

        self.turn += 1;
        let turn = self.turn;
        self.generating = Some(turn);
        self.deps.metrics.turn();
        debug!(turn, context = history.len(), "Generating reply");

        let bot = active.bot.clone();
        let cancel = self.turn_cancel.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(
            async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    outcome = generator.generate(&bot, &history, &text) => Some(outcome),
                };
                match outcome {
                    Some(outcome) => {
                        let _ = tx.send(Internal::Generated { turn, outcome });
                    }
                    None => debug!(turn, "Generation cancelled"),
                }
            }
            .in_current_span(),
        );
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Generated { turn, outcome } => self.on_generated(turn, outcome),
            Internal::Synthesized { turn, text, result } => self.on_synthesized(turn, text, result),
            Internal::Deliver(item) => self.deliver(item),
        }
    }

    fn on_generated(&mut self, turn: u64, outcome: GenerationOutcome) {
        if self.generating != Some(turn) {
            debug!(turn, "Discarding stale reply");
            return;
        }
        self.generating = None;
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if outcome.fallback {
            self.deps.metrics.generation_failed();
            warn!(turn, error = ?outcome.error, "Replying with fallback");
        }
        active
            .conversation
            .push(Message::assistant(outcome.text.clone()));
        self.out.emit(ServerEvent::AiResponse {
            content: outcome.text.clone(),
        });
        if active.bot.auto_speak && self.deps.synthesizer.is_some() {
            self.synth_backlog.push_back((turn, outcome.text));
            self.pump_synthesis();
        }

        if let Some(next) = self.pending.take() {
            self.start_generation(next);
        }
    }

    /// Start the next synthesis if none is running. One at a time keeps audio in reply order.
    fn pump_synthesis(&mut self) {
        if self.synthesizing.is_some() {
            return;
        }
        let Some(synthesizer) = self.deps.synthesizer.clone() else {
            return;
        };
        let Some((turn, text)) = self.synth_backlog.pop_front() else {
            return;
        };
        let voice = self
            .active
            .as_ref()
            .and_then(|a| a.bot.voice.clone())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.deps.settings.default_voice.clone());

        self.synthesizing = Some(turn);
        let timeout = self.deps.settings.synthesis_timeout;
        let cancel = self.turn_cancel.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(
            async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = tokio::time::timeout(timeout, synthesizer.synthesize(&text, &voice)) => Some(result),
                };
                let result = match result {
                    None => {
                        debug!(turn, "Synthesis cancelled");
                        return;
                    }
                    Some(Ok(Ok(audio))) => Ok(audio),
                    Some(Ok(Err(e))) => Err(e.to_string()),
                    Some(Err(_)) => Err(format!(
                        "speech synthesis timed out after {}ms",
                        timeout.as_millis()
                    )),
                };
                let _ = tx.send(Internal::Synthesized { turn, text, result });
            }
            .in_current_span(),
        );
    }

    fn on_synthesized(&mut self, turn: u64, text: String, result: Result<SynthesizedAudio, String>) {
        if self.synthesizing == Some(turn) {
            self.synthesizing = None;
        }
        if turn < self.floor {
            debug!(turn, floor = self.floor, "Discarding stale audio");
            self.pump_synthesis();
            return;
        }
        match result {
            Ok(audio) => {
                if let Err(rejected) = self.playback.enqueue(PlaybackItem { audio, text, turn }) {
                    debug!(%rejected, "Playback rejected audio");
                }
            }
            Err(message) => {
                warn!(turn, error = %message, "Speech synthesis failed, reply stays text-only");
                self.deps.metrics.synthesis_failed();
                self.out.emit(ServerEvent::TtsError { message });
            }
        }
        self.pump_synthesis();
    }

    fn deliver(&mut self, item: PlaybackItem) {
        if item.turn < self.floor || self.active.is_none() {
            debug!(turn = item.turn, "Dropping audio from a cancelled turn");
            return;
        }
        let audio = base64::engine::general_purpose::STANDARD.encode(&item.audio.bytes);
        self.out.emit(ServerEvent::AudioResponse {
            audio,
            text: item.text,
            format: item.audio.format.as_str().to_string(),
        });
    }

    fn handle_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { turn } if turn >= self.floor => {
                self.apply(TurnInput::PlaybackStarted)
            }
            PlaybackEvent::Drained { turn } if turn >= self.floor => {
                self.apply(TurnInput::PlaybackDrained)
            }
            PlaybackEvent::Failed { turn, error } => {
                warn!(turn, %error, "Playback failed");
                self.deps.metrics.record_error("playback");
            }
            _ => {}
        }
    }

    fn apply(&mut self, input: TurnInput) {
        for action in self.coordinator.handle(input) {
            match action {
                TurnAction::StopPlayback => {
                    self.turn += 1;
                    self.floor = self.turn;
                    let cleared = self.playback.stop(self.floor);
                    debug!(cleared, floor = self.floor, "Playback stopped");
                }
                TurnAction::CancelTurn => {
                    self.turn_cancel.cancel();
                    self.turn_cancel = CancellationToken::new();
                    self.generating = None;
                    self.pending = None;
                    self.synthesizing = None;
                    self.synth_backlog.clear();
                }
                TurnAction::EmitInterrupted => {
                    info!(floor = self.floor, "Interrupted");
                    self.deps.metrics.interrupt();
                    self.out.emit(ServerEvent::Interrupted);
                }
                TurnAction::EmitSpeechStarted => self.out.emit(ServerEvent::SpeechStarted),
                TurnAction::EmitSpeechEnded => self.out.emit(ServerEvent::SpeechEnded),
            }
        }
    }

    /// End the session once: close the transcriber, halt playback, persist, notify.
    async fn stop(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let Some(mut active) = self.active.take() else {
            return;
        };

        if let Some(stt) = self.transcriber.take() {
            stt.close();
        }
        self.stt_events = None;
        self.apply(TurnInput::Disconnect);
        self.playback.shutdown();
        active.session.status = SessionStatus::Ended;

        if active.conversation.is_empty() {
            debug!("Empty conversation, nothing to persist");
        } else {
            let record = ConversationRecord::from_session(&active.session, &active.conversation);
            match self.deps.conversations.persist(&record).await {
                Ok(()) => info!(messages = record.messages.len(), "Conversation saved"),
                Err(e) => {
                    error!(error = %e, "Failed to save conversation");
                    self.deps.metrics.persistence_failed();
                    self.out.emit(ServerEvent::processing_error(format!(
                        "failed to save conversation: {e}"
                    )));
                }
            }
        }

        self.deps.metrics.session_ended();
        info!(session_id = %active.session.id, "Session ended");
        self.out.emit(ServerEvent::SessionEnded);
    }
}
