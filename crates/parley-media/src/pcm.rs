//! Raw PCM helpers.

use std::time::Duration;

/// Decode little-endian 16-bit samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Playback duration of mono 16-bit PCM at `sample_rate`.
pub fn pcm_duration(byte_len: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let samples = (byte_len / 2) as u64;
    Duration::from_millis(samples * 1000 / sample_rate as u64)
}

/// Rough spoken length of `text` (about 15 characters per second, at least half a second).
pub fn estimate_speech_duration(text: &str) -> Duration {
    let chars = text.chars().filter(|c| !c.is_whitespace()).count() as u64;
    Duration::from_millis((chars * 1000 / 15).max(500))
}
