use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use resub_core::{ResourceChange, generate_id};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::distributed::DistributedCoordinator;
use crate::rpc::RpcNotification;
use crate::subscriptions::{
    DeliveryError, MemoryResourceProvider, NotificationTransport, Session, SubscriptionEngine,
    UserContext, handle_message,
};

const OUTBOUND_BUFFER: usize = 256;

/// Outbound queues of the open WebSocket connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<String, mpsc::Sender<String>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn register(&self, connection_id: &str, sender: mpsc::Sender<String>) {
        self.connections.insert(connection_id.to_string(), sender);
        tracing::debug!(connection_id = %connection_id, "Connection registered");
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        let removed = self.connections.remove(connection_id).is_some();
        if removed {
            tracing::debug!(connection_id = %connection_id, "Connection unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl NotificationTransport for ConnectionHub {
    async fn send(
        &self,
        connection_id: &str,
        notification: RpcNotification,
    ) -> Result<(), DeliveryError> {
        // Clone the sender so no map guard is held across the await
        let sender = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DeliveryError::ConnectionClosed(connection_id.to_string()))?;

        let text = serde_json::to_string(&notification)?;
        sender
            .send(text)
            .await
            .map_err(|_| DeliveryError::ConnectionClosed(connection_id.to_string()))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SubscriptionEngine>,
    pub hub: Arc<ConnectionHub>,
    pub provider: Arc<MemoryResourceProvider>,
    pub coordinator: Option<Arc<DistributedCoordinator>>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/changes", post(publish_change))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let user_context: UserContext = params
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_context))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_context: UserContext) {
    let session = Session::new(generate_id(), user_context);
    let connection_id = session.connection_id.clone();

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    state.hub.register(&connection_id, tx);
    tracing::info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(reply) = handle_message(&state.engine, &session, text.as_str()).await else {
                            continue;
                        };
                        if let Err(e) = sender.send(Message::Text(reply.into())).await {
                            tracing::debug!(connection_id = %connection_id, error = %e, "Failed to send response");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            tracing::debug!(error = %e, "Failed to send pong");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(connection_id = %connection_id, "Client closed WebSocket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                let Some(text) = outbound else { break };
                if let Err(e) = sender.send(Message::Text(text.into())).await {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Failed to send notification");
                    break;
                }
            }
        }
    }

    state.hub.unregister(&connection_id);
    let removed = state.engine.cleanup_connection(&connection_id);
    tracing::info!(
        connection_id = %connection_id,
        subscriptions_removed = removed,
        "WebSocket connection closed"
    );
}

async fn publish_change(
    State(state): State<AppState>,
    Json(change): Json<ResourceChange>,
) -> Response {
    if !change.is_concrete() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "change uri must not contain wildcards" })),
        )
            .into_response();
    }

    state.provider.apply(&change);
    let receivers = state.engine.publish_change(change);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "receivers": receivers })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let degraded = state
        .coordinator
        .as_ref()
        .is_some_and(|coordinator| coordinator.is_degraded());
    Json(json!({
        "status": "ok",
        "connections": state.hub.len(),
        "distributed": state.coordinator.is_some(),
        "degraded": degraded,
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let distributed = match &state.coordinator {
        Some(coordinator) => serde_json::to_value(coordinator.get_distributed_stats().await)
            .unwrap_or(Value::Null),
        None => Value::Null,
    };
    let engine = serde_json::to_value(state.engine.stats()).unwrap_or(Value::Null);
    Json(json!({ "engine": engine, "distributed": distributed }))
}

async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RESOURCE_UPDATED_METHOD;

    #[tokio::test]
    async fn hub_routes_notifications_to_registered_connection() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register("c1", tx);

        let notification = RpcNotification::new(RESOURCE_UPDATED_METHOD, json!({"uri": "file:///a"}));
        hub.send("c1", notification).await.unwrap();

        let text = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["method"], RESOURCE_UPDATED_METHOD);
        assert_eq!(value["params"]["uri"], "file:///a");
    }

    #[tokio::test]
    async fn hub_reports_closed_connections() {
        let hub = ConnectionHub::new();
        let notification = RpcNotification::new(RESOURCE_UPDATED_METHOD, json!({}));
        assert!(matches!(
            hub.send("missing", notification.clone()).await,
            Err(DeliveryError::ConnectionClosed(_))
        ));

        let (tx, rx) = mpsc::channel(1);
        hub.register("c1", tx);
        drop(rx);
        assert!(matches!(
            hub.send("c1", notification).await,
            Err(DeliveryError::ConnectionClosed(_))
        ));

        assert!(hub.unregister("c1"));
        assert!(!hub.unregister("c1"));
        assert!(hub.is_empty());
    }
}
