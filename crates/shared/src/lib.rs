//! Relay Shared Types
//!
//! This crate contains the wire model and error type shared by the relay
//! server and anything that speaks its protocol.

pub mod error;
pub mod message;

pub use error::*;
pub use message::*;
