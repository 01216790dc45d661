//! Voice session gateway.
//!
//! Hosts the WebSocket endpoint, runs one session actor per connection, and
//! coordinates turns between transcription, generation, synthesis, and playback.

pub mod auth;
pub mod connection;
pub mod metrics;
pub mod server;
pub mod session;
pub mod state;
pub mod turn;

pub use server::{router, serve, start_gateway};
pub use session::{SessionCommand, SessionController, SessionDeps, SessionHandle, SessionSettings};
pub use state::GatewayState;
