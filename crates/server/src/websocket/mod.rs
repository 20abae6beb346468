//! WebSocket message relay
//!
//! Every connected client can broadcast to every other connected client.
//!
//! # Architecture
//!
//! - **Connection**: transport halves (axum WebSocket or in-memory)
//! - **Client**: one identified connection with its outbound queue
//! - **Heartbeat**: periodic liveness probe per client
//! - **Dispatcher**: single actor owning the registry of live clients
//! - **Events**: pluggable business handler for inbound messages
//! - **Handler**: Axum WebSocket route handler and session loop

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod handler;
pub mod heartbeat;

pub use client::{Client, ClientOptions};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, ShutdownPolicy, StatsSnapshot};
pub use events::{dispatch_request, DefaultHandler, EventHandler, HandlerRegistry};
pub use handler::{new_client, run_session, ws_handler};
