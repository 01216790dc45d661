//! Turn-taking and barge-in state machine.
//!
//! Pure: it consumes voice-activity and playback signals and returns the
//! actions the session must apply. No timers, no I/O. Hangover for voice end
//! is handled upstream (server VAD or the transcriber's utterance-end event).

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    /// The user is speaking.
    Listening,
    /// A reply is playing.
    Speaking,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnInput {
    VoiceStart,
    VoiceEnd,
    /// Explicit client interrupt.
    Interrupt,
    PlaybackStarted,
    PlaybackDrained,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    /// Stop current playback and clear the queue.
    StopPlayback,
    /// Discard the in-flight generation or synthesis.
    CancelTurn,
    EmitInterrupted,
    EmitSpeechStarted,
    EmitSpeechEnded,
}

const INTERRUPT: [TurnAction; 3] = [
    TurnAction::StopPlayback,
    TurnAction::CancelTurn,
    TurnAction::EmitInterrupted,
];

#[derive(Debug)]
pub struct TurnCoordinator {
    state: TurnState,
}

impl Default for TurnCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnCoordinator {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Apply one input and return the resulting actions, in the order they must run.
    pub fn handle(&mut self, input: TurnInput) -> Vec<TurnAction> {
        use TurnInput::*;
        use TurnState::*;

        let (next, actions) = match (self.state, input) {
            (Disconnected, _) => (Disconnected, vec![]),
            (_, Disconnect) => (
                Disconnected,
                vec![TurnAction::StopPlayback, TurnAction::CancelTurn],
            ),

            (_, Interrupt) => (Idle, INTERRUPT.to_vec()),

            // Barge-in: interrupt the reply, then listen.
            (Speaking, VoiceStart) => {
                let mut actions = INTERRUPT.to_vec();
                actions.push(TurnAction::EmitSpeechStarted);
                (Listening, actions)
            }
            (Idle, VoiceStart) => (Listening, vec![TurnAction::EmitSpeechStarted]),
            (Listening, VoiceStart) => (Listening, vec![]),

            (Listening, VoiceEnd) => (Idle, vec![TurnAction::EmitSpeechEnded]),
            (state, VoiceEnd) => (state, vec![]),

            (Idle | Listening, PlaybackStarted) => (Speaking, vec![]),
            (Speaking, PlaybackStarted) => (Speaking, vec![]),

            (Speaking, PlaybackDrained) => (Idle, vec![]),
            (state, PlaybackDrained) => (state, vec![]),
        };

        if next != self.state {
            debug!(from = ?self.state, to = ?next, ?input, "Turn state changed");
        }
        self.state = next;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TurnAction::*;

    #[test]
    fn test_listen_then_idle() {
        let mut turn = TurnCoordinator::new();
        assert_eq!(turn.handle(TurnInput::VoiceStart), vec![EmitSpeechStarted]);
        assert_eq!(turn.state(), TurnState::Listening);
        assert!(turn.handle(TurnInput::VoiceStart).is_empty());
        assert_eq!(turn.handle(TurnInput::VoiceEnd), vec![EmitSpeechEnded]);
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[test]
    fn test_reply_playback_cycle() {
        let mut turn = TurnCoordinator::new();
        assert!(turn.handle(TurnInput::PlaybackStarted).is_empty());
        assert_eq!(turn.state(), TurnState::Speaking);
        // A second item of the same reply.
        turn.handle(TurnInput::PlaybackStarted);
        assert!(turn.handle(TurnInput::PlaybackDrained).is_empty());
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[test]
    fn test_voice_while_speaking_is_barge_in() {
        let mut turn = TurnCoordinator::new();
        turn.handle(TurnInput::PlaybackStarted);
        let actions = turn.handle(TurnInput::VoiceStart);
        assert_eq!(
            actions,
            vec![StopPlayback, CancelTurn, EmitInterrupted, EmitSpeechStarted]
        );
        assert_eq!(turn.state(), TurnState::Listening);
    }

    #[test]
    fn test_interrupt_from_any_state_returns_to_idle() {
        for setup in [
            vec![],
            vec![TurnInput::VoiceStart],
            vec![TurnInput::PlaybackStarted],
        ] {
            let mut turn = TurnCoordinator::new();
            for input in setup {
                turn.handle(input);
            }
            let actions = turn.handle(TurnInput::Interrupt);
            assert_eq!(actions, vec![StopPlayback, CancelTurn, EmitInterrupted]);
            assert_eq!(turn.state(), TurnState::Idle);
        }
    }

    #[test]
    fn test_stray_signals_are_ignored() {
        let mut turn = TurnCoordinator::new();
        assert!(turn.handle(TurnInput::VoiceEnd).is_empty());
        assert!(turn.handle(TurnInput::PlaybackDrained).is_empty());
        assert_eq!(turn.state(), TurnState::Idle);

        turn.handle(TurnInput::PlaybackStarted);
        assert!(turn.handle(TurnInput::VoiceEnd).is_empty());
        assert_eq!(turn.state(), TurnState::Speaking);
    }

    #[test]
    fn test_disconnected_is_terminal() {
        let mut turn = TurnCoordinator::new();
        turn.handle(TurnInput::PlaybackStarted);
        assert_eq!(
            turn.handle(TurnInput::Disconnect),
            vec![StopPlayback, CancelTurn]
        );
        assert!(turn.handle(TurnInput::VoiceStart).is_empty());
        assert!(turn.handle(TurnInput::Interrupt).is_empty());
        assert_eq!(turn.state(), TurnState::Disconnected);
    }
}
