//! Energy-based Voice Activity Detection (VAD).

use crate::pcm::bytes_to_samples;

/// Speech boundary reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechEnded,
}

/// Voice Activity Detector using RMS energy threshold on 16-bit PCM.
///
/// Incoming audio is cut into fixed 20ms frames; partial frames are carried
/// over to the next call.
pub struct VoiceActivityDetector {
    /// RMS threshold for speech detection.
    threshold: f64,
    /// Consecutive silent frames before declaring speech end (hangover).
    min_silent_frames: usize,
    frame_size: usize,
    speech_active: bool,
    silent_count: usize,
    carry: Vec<i16>,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, min_silent_frames: usize, sample_rate: u32) -> Self {
        Self {
            threshold,
            min_silent_frames: min_silent_frames.max(1),
            frame_size: (sample_rate as usize / 50).max(1),
            speech_active: false,
            silent_count: 0,
            carry: Vec::new(),
        }
    }

    /// Defaults for 16kHz input: threshold 300, ~300ms hangover.
    pub fn default_16khz() -> Self {
        Self::new(300.0, 15, 16_000)
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Feed raw s16le bytes, returning every boundary crossed in order.
    pub fn push_pcm(&mut self, bytes: &[u8]) -> Vec<VadTransition> {
        self.carry.extend(bytes_to_samples(bytes));
        let mut transitions = Vec::new();
        let mut offset = 0;
        while self.carry.len() - offset >= self.frame_size {
            let end = offset + self.frame_size;
            let energy = Self::rms(&self.carry[offset..end]);
            if let Some(t) = self.process_energy(energy) {
                transitions.push(t);
            }
            offset = end;
        }
        self.carry.drain(..offset);
        transitions
    }

    fn process_energy(&mut self, energy: f64) -> Option<VadTransition> {
        if energy > self.threshold {
            self.silent_count = 0;
            if !self.speech_active {
                self.speech_active = true;
                return Some(VadTransition::SpeechStarted);
            }
        } else if self.speech_active {
            self.silent_count += 1;
            if self.silent_count >= self.min_silent_frames {
                self.speech_active = false;
                self.silent_count = 0;
                return Some(VadTransition::SpeechEnded);
            }
        }
        None
    }

    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.silent_count = 0;
        self.carry.clear();
    }
}
