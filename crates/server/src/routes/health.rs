//! Health check and status endpoints

use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::Value;

use crate::state::AppState;
use crate::websocket::StatsSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dispatcher: String,
    pub connected: usize,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub dispatcher: StatsSnapshot,
    pub handler: HashMap<String, Value>,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let running = !state.dispatcher.is_stopped();

    let overall_status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall_status,
        Json(HealthResponse {
            status: if running {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            dispatcher: if running {
                "running".to_string()
            } else {
                "stopped".to_string()
            },
            connected: state.dispatcher.live_count(),
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Dispatcher counters plus whatever the active handler reports
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        dispatcher: state.dispatcher.stats(),
        handler: state.handlers.status().await,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::routes::create_router;
    use crate::websocket::{DefaultHandler, Dispatcher, HandlerRegistry};

    use super::*;

    async fn test_state() -> (AppState, tokio::task::JoinHandle<()>) {
        let config = Config::default();
        let (dispatcher, task) = Dispatcher::spawn(config.dispatcher_config());
        let handlers = HandlerRegistry::new(Arc::new(DefaultHandler::new(dispatcher.clone()))).await;
        (AppState::new(&config, dispatcher, handlers), task)
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health_reports_running_dispatcher() {
        let (state, _task) = test_state().await;

        let (status, body) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["dispatcher"], "running");
        assert_eq!(body["connected"], 0);
    }

    #[tokio::test]
    async fn test_health_unavailable_after_shutdown() {
        let (state, task) = test_state().await;
        state.dispatcher.shutdown().await.unwrap();
        task.await.unwrap();

        let (status, body) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["dispatcher"], "stopped");
    }

    #[tokio::test]
    async fn test_status_includes_handler_report() {
        let (state, _task) = test_state().await;

        let (status, body) = get_json(state, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dispatcher"]["live_clients"], 0);
        assert_eq!(body["handler"]["handler"], "default");
    }
}
