//! Core types, config, errors, wire protocol, and stores for Parley.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod store;
pub mod supabase;
pub mod types;
