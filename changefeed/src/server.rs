//! HTTP surface: health, stats, metrics and the WebSocket change stream

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use changefeed_cluster::{ChangeHub, EventSink, SinkError};
use changefeed_core::{metrics, ChangeEvent};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChangeHub>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_handler))
        .route("/ws/changes", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check (always returns OK if server is running)
async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Writes each event as a JSON text frame
struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl EventSink for WebSocketSink {
    async fn send(&mut self, event: &ChangeEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)
            .map_err(|e| SinkError::Transport(format!("encode failed: {e}")))?;

        self.sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}

async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Clients only ever send control frames
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ChangeHub>) {
    let (sender, mut receiver) = socket.split();
    let cancel = hub.cancel_token().child_token();

    // Client close or disconnect ends the session
    let reader = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                    Ok(_) => {}
                }
            }
            cancel.cancel();
        })
    };

    info!("WebSocket change stream connected");

    let session = hub.open_session(WebSocketSink { sender });
    match session.run(cancel.clone()).await {
        Ok(summary) => info!(
            subscription_id = %summary.id,
            delivered = summary.delivered,
            dropped = summary.dropped,
            reason = ?summary.reason,
            "WebSocket change stream closed"
        ),
        Err(e) => error!("WebSocket session failed: {}", e),
    }

    cancel.cancel();
    reader.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use changefeed_cluster::HubConfig;
    use changefeed_core::Row;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<ChangeHub>) {
        let hub = Arc::new(ChangeHub::new(HubConfig::default()));
        let router = create_router(AppState { hub: hub.clone() });
        (router, hub)
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app();
        let (status, body) = get_body(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_stats_reflects_hub() {
        let (router, hub) = app();
        let _handle = hub.registry().register();
        hub.broadcaster()
            .publish(ChangeEvent::insert("users", Row::new()).unwrap());

        let (status, body) = get_body(router, "/stats").await;
        assert_eq!(status, StatusCode::OK);

        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["subscribers"], 1);
        assert_eq!(stats["published"], 1);
        assert_eq!(stats["delivered"], 1);
        assert_eq!(stats["relay_failures"], 0);
    }

    #[tokio::test]
    async fn test_metrics_exposes_hub_counters() {
        let (router, hub) = app();
        hub.broadcaster()
            .publish(ChangeEvent::insert("users", Row::new()).unwrap());

        let (status, body) = get_body(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("changefeed_events_published_total"));
    }

    #[tokio::test]
    async fn test_websocket_requires_upgrade() {
        let (router, _) = app();
        let (status, _) = get_body(router, "/ws/changes").await;
        assert!(status.is_client_error());
    }
}
