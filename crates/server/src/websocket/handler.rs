//! WebSocket handler for Axum
//!
//! Upgrades `GET /ws`, wraps the socket in a [`Client`], registers it with
//! the dispatcher and runs the read loop until the connection goes away.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;
use relay_shared::RelayResult;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

use super::{
    client::{Client, ClientOptions},
    connection::{FrameSink, FrameStream},
    dispatcher::DispatcherHandle,
    events::{dispatch_request, HandlerRegistry},
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    /// Client identity; a random one is assigned when absent
    id: Option<String>,
}

/// WebSocket handler - upgrades the HTTP connection to a relay session
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, ApiError> {
    if app_state.dispatcher.is_stopped() {
        return Err(ApiError::ServiceUnavailable);
    }

    let client_id = match params.id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("id must not be blank".to_string()));
        }
        Some(id) => id,
        None => Uuid::new_v4().to_string(),
    };

    tracing::info!(client_id = %client_id, "WebSocket connection upgrade requested");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, client_id, app_state)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, client_id: String, app_state: AppState) {
    let (sender, receiver) = socket.split();

    let client = match new_client(
        client_id.clone(),
        sender,
        receiver,
        &app_state.dispatcher,
        &app_state.client_options,
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Failed to register client");
            return;
        }
    };

    run_session(client, &app_state.handlers).await;
}

/// Wrap an established connection and enqueue its registration.
///
/// This is the accept boundary for any transport: the caller hands over both
/// halves and gets back a registered client. The `Connected` notice is sent
/// by the dispatcher once the registration is processed.
pub async fn new_client(
    id: impl Into<String>,
    sink: impl FrameSink,
    stream: impl FrameStream,
    dispatcher: &DispatcherHandle,
    options: &ClientOptions,
) -> RelayResult<Arc<Client>> {
    let client = Client::new(id, sink, stream, dispatcher.clone(), options);

    if let Err(e) = dispatcher.register(Arc::clone(&client)).await {
        // Nobody will ever destroy it, so tear it down here
        if let Err(close_err) = client.close_connection() {
            tracing::debug!(client_id = %client.id(), error = %close_err, "Connection already closed");
        }
        return Err(e);
    }

    Ok(client)
}

/// Drive one client until its connection ends.
///
/// Every inbound payload goes through [`dispatch_request`]; a payload that
/// fails to decode or that the handler rejects is logged and skipped. Once
/// reading fails the client is closed, which announces `Disconnected` and
/// enqueues its destruction.
pub async fn run_session(client: Arc<Client>, handlers: &HandlerRegistry) {
    let client_id = client.id().to_string();

    if let Err(e) = handlers.current().await.on_register(&client).await {
        tracing::warn!(client_id = %client_id, error = %e, "Register hook failed");
    }

    loop {
        let raw = match client.read_message().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "Read loop ending");
                break;
            }
        };

        if let Err(e) = dispatch_request(handlers, &client, &raw).await {
            tracing::warn!(client_id = %client_id, error = %e, "Failed to handle inbound message");
        }
    }

    tracing::info!(client_id = %client_id, "WebSocket connection closing");
    client.close();

    if let Err(e) = handlers.current().await.on_destroy(&client).await {
        tracing::warn!(client_id = %client_id, error = %e, "Destroy hook failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use relay_shared::RelayError;

    use super::*;
    use crate::websocket::connection::{memory, Frame};
    use crate::websocket::dispatcher::{Dispatcher, DispatcherConfig};

    #[tokio::test]
    async fn test_new_client_closes_connection_when_dispatcher_gone() {
        let (dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        drop(dispatcher);

        let (sink, stream, mut peer) = memory::pair();
        let result = new_client("alice", sink, stream, &handle, &ClientOptions::default()).await;
        assert!(matches!(result, Err(RelayError::DispatcherClosed)));

        let frame = tokio::time::timeout(Duration::from_secs(1), peer.next_frame())
            .await
            .unwrap();
        assert_eq!(frame, Some(Frame::Close));
    }
}
