//! Voice media pipeline: VAD, streaming STT, TTS, and ordered playback.

pub mod pcm;
pub mod playback;
pub mod stt;
pub mod tts;
pub mod vad;
