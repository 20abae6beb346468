//! Relay Server Library
//!
//! Real-time WebSocket message relay: every connected client can broadcast
//! to every other connected client.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::ApiError;
pub use state::AppState;
