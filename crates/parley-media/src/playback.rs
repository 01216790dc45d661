//! Ordered speech playback.
//!
//! Items play strictly one at a time in enqueue order. Every item carries the
//! turn it belongs to; `stop` clears the queue, halts the current item, and
//! raises the minimum accepted turn in one locked step, so audio from an
//! interrupted turn can never start afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tts::SynthesizedAudio;

/// One synthesized reply waiting to be played.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub audio: SynthesizedAudio,
    /// Text the audio was synthesized from.
    pub text: String,
    pub turn: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { turn: u64 },
    Finished { turn: u64 },
    Failed { turn: u64, error: String },
    /// Queue ran empty after playing items from `turn`.
    Drained { turn: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("playback item for turn {turn} rejected; current turn is {current}")]
pub struct Rejected {
    pub turn: u64,
    pub current: u64,
}

/// Performs the actual audio output. `play` resolves when the item has
/// finished playing; dropping the future halts it.
#[async_trait]
pub trait Player: Send + Sync {
    async fn play(&self, item: &PlaybackItem) -> Result<()>;
}

struct QueueState {
    items: VecDeque<PlaybackItem>,
    min_turn: u64,
    /// Turn of the item being played, if any.
    playing: Option<u64>,
    current: CancellationToken,
}

/// FIFO playback queue driven by a background task.
pub struct PlaybackQueue {
    state: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PlaybackQueue {
    pub fn spawn(player: Arc<dyn Player>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        let state = Arc::new(Mutex::new(QueueState {
            items: VecDeque::new(),
            min_turn: 0,
            playing: None,
            current: CancellationToken::new(),
        }));
        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(play_loop(
            state.clone(),
            wake.clone(),
            shutdown.clone(),
            player,
            events,
        ));

        Self {
            state,
            wake,
            shutdown,
        }
    }

    /// Append an item. Items from turns older than the last `stop` are rejected.
    pub fn enqueue(&self, item: PlaybackItem) -> std::result::Result<(), Rejected> {
        {
            let mut state = lock(&self.state);
            if item.turn < state.min_turn {
                return Err(Rejected {
                    turn: item.turn,
                    current: state.min_turn,
                });
            }
            state.items.push_back(item);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Clear pending items, halt the current one, and reject anything older than `next_turn`.
    pub fn stop(&self, next_turn: u64) -> usize {
        let mut state = lock(&self.state);
        let cleared = state.items.len();
        state.items.clear();
        state.min_turn = state.min_turn.max(next_turn);
        state.playing = None;
        state.current.cancel();
        state.current = CancellationToken::new();
        debug!(cleared, min_turn = state.min_turn, "Playback stopped");
        cleared
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.playing.is_none() && state.items.is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop playback and end the background task.
    pub fn shutdown(&self) {
        self.stop(u64::MAX);
        self.shutdown.cancel();
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn play_loop(
    state: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    player: Arc<dyn Player>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    loop {
        // Take the next item, or report the drain, under one lock.
        let next = {
            let mut state = lock(&state);
            match state.items.pop_front() {
                Some(item) => {
                    state.playing = Some(item.turn);
                    Some((item, state.current.clone()))
                }
                None => {
                    if let Some(turn) = state.playing.take() {
                        let _ = events.send(PlaybackEvent::Drained { turn });
                    }
                    None
                }
            }
        };

        let Some((item, halt)) = next else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake.notified() => continue,
            }
        };

        let turn = item.turn;
        let _ = events.send(PlaybackEvent::Started { turn });
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = halt.cancelled() => {
                debug!(turn, "Playback item halted");
            }
            result = player.play(&item) => match result {
                Ok(()) => {
                    let _ = events.send(PlaybackEvent::Finished { turn });
                }
                Err(e) => {
                    warn!(turn, error = %e, "Playback item failed, continuing");
                    let _ = events.send(PlaybackEvent::Failed {
                        turn,
                        error: e.to_string(),
                    });
                }
            },
        }
    }
    debug!("Playback task finished");
}
