//! Shared application state

use crate::config::Config;
use crate::websocket::{ClientOptions, DispatcherHandle, HandlerRegistry};

/// State handed to every axum handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherHandle,
    pub handlers: HandlerRegistry,
    pub client_options: ClientOptions,
}

impl AppState {
    pub fn new(config: &Config, dispatcher: DispatcherHandle, handlers: HandlerRegistry) -> Self {
        Self {
            dispatcher,
            handlers,
            client_options: config.client_options(),
        }
    }
}
