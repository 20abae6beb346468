//! Business event handling
//!
//! Inbound envelopes are interpreted by a pluggable [`EventHandler`]. Exactly
//! one handler is active at a time; it lives in a [`HandlerRegistry`] that is
//! built at startup and passed to every session rather than looked up from
//! global state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_shared::{unix_now, Message, MessageType, RelayResult};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::client::Client;
use super::dispatcher::DispatcherHandle;

/// Key/value snapshot reported by a handler
pub type HandlerStatus = HashMap<String, Value>;

/// Business logic invoked for client lifecycle and inbound messages
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A client finished registration
    async fn on_register(&self, client: &Arc<Client>) -> RelayResult<()>;

    /// A client is going away
    async fn on_destroy(&self, client: &Arc<Client>) -> RelayResult<()>;

    async fn on_heartbeat(&self, message: Message, client: &Arc<Client>) -> RelayResult<()>;

    /// `System` and `Broadcast` messages
    async fn on_broadcast(&self, message: Message, client: &Arc<Client>) -> RelayResult<()>;

    /// Every other type, including custom extension types
    async fn on_default(
        &self,
        kind: MessageType,
        message: Message,
        client: &Arc<Client>,
    ) -> RelayResult<()>;

    /// Called when the handler is installed
    async fn init(&self) {}

    /// Called when the handler is replaced
    async fn close(&self) {}

    fn status(&self) -> HandlerStatus;
}

// =============================================================================
// Registry
// =============================================================================

/// Holder of the single active handler
#[derive(Clone)]
pub struct HandlerRegistry {
    active: Arc<RwLock<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    /// Install the first handler
    pub async fn new(handler: Arc<dyn EventHandler>) -> Self {
        handler.init().await;
        Self {
            active: Arc::new(RwLock::new(handler)),
        }
    }

    /// Replace the active handler.
    ///
    /// The previous handler is closed before the new one is initialized, and
    /// no session can pick up either handler while the swap is in progress.
    pub async fn install(&self, handler: Arc<dyn EventHandler>) {
        let mut active = self.active.write().await;
        active.close().await;
        handler.init().await;
        *active = handler;
        tracing::info!("Event handler replaced");
    }

    pub async fn current(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&*self.active.read().await)
    }

    pub async fn status(&self) -> HandlerStatus {
        self.active.read().await.status()
    }
}

/// Decode one inbound payload and route it to the active handler
pub async fn dispatch_request(
    handlers: &HandlerRegistry,
    client: &Arc<Client>,
    raw: &str,
) -> RelayResult<()> {
    let message = Message::decode(raw)?;

    tracing::debug!(
        client_id = %client.id(),
        kind = ?message.kind,
        "Inbound message"
    );

    let handler = handlers.current().await;
    match message.kind {
        MessageType::Broadcast | MessageType::System => handler.on_broadcast(message, client).await,
        MessageType::HeartBeat => handler.on_heartbeat(message, client).await,
        kind => handler.on_default(kind, message, client).await,
    }
}

// =============================================================================
// Default handler
// =============================================================================

/// Relays group messages and ignores everything else
pub struct DefaultHandler {
    dispatcher: DispatcherHandle,
}

impl DefaultHandler {
    pub fn new(dispatcher: DispatcherHandle) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl EventHandler for DefaultHandler {
    async fn on_register(&self, client: &Arc<Client>) -> RelayResult<()> {
        tracing::info!(client_id = %client.id(), "Client session started");
        Ok(())
    }

    async fn on_destroy(&self, client: &Arc<Client>) -> RelayResult<()> {
        tracing::info!(client_id = %client.id(), "Client session ended");
        Ok(())
    }

    async fn on_heartbeat(&self, _message: Message, client: &Arc<Client>) -> RelayResult<()> {
        tracing::debug!(client_id = %client.id(), "Heartbeat from peer");
        Ok(())
    }

    async fn on_broadcast(&self, mut message: Message, client: &Arc<Client>) -> RelayResult<()> {
        // The sender is whoever owns the connection, whatever the envelope claims
        message.id = client.id().to_string();
        if message.sent_at == 0 {
            message.sent_at = unix_now();
        }
        self.dispatcher.broadcast(message).await
    }

    async fn on_default(
        &self,
        kind: MessageType,
        _message: Message,
        client: &Arc<Client>,
    ) -> RelayResult<()> {
        tracing::debug!(
            client_id = %client.id(),
            kind = i64::from(kind),
            "No handling for message type"
        );
        Ok(())
    }

    fn status(&self) -> HandlerStatus {
        let stats = self.dispatcher.stats();
        HashMap::from([
            ("handler".to_string(), json!("default")),
            ("connected".to_string(), json!(stats.live_clients)),
            ("registrations".to_string(), json!(stats.registrations)),
            ("broadcasts".to_string(), json!(stats.broadcasts)),
            ("delivery_failures".to_string(), json!(stats.delivery_failures)),
        ])
    }
}
