//! Reply generation: persona prompts, history windowing, and the
//! [`ResponseGenerator`] that turns a user utterance into a spoken reply.

pub mod generator;
pub mod prompt;

pub use generator::{GenerationOutcome, GeneratorSettings, ResponseGenerator};
