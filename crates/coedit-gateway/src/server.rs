//! Gateway server: WebSocket RPC plus a few read-only HTTP routes

use crate::ws::{handle_connection, WsState};
use axum::{
    extract::{Path as AxumPath, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use coedit_core::{CoordinatorConfig, Lock, LockStats};
use coedit_engine::Coordinator;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub async fn start_gateway(config: CoordinatorConfig) -> anyhow::Result<()> {
    let port = config.gateway.port;
    let addr = format!("{}:{}", config.gateway.bind.to_addr(), port);

    let coordinator = Arc::new(Coordinator::from_config(config).await?);
    coordinator.start();

    let state = Arc::new(WsState::new(coordinator.clone()));
    let app = build_router(state);

    info!("coedit gateway listening on {}", addr);
    info!("  WebSocket: ws://{}/ws", addr);
    info!("  Health:    http://{}/health", addr);
    info!("  Storage:   {:?}", coordinator.config().storage.backend);
    info!("  Pipelines: {}", coordinator.config().pipelines.names().join(", "));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    Ok(())
}

pub fn build_router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/documents/:document_id/locks", get(document_locks_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<WsState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let intents = coordinator.intents().len().await;
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "connections": state.connection_count(),
        "watchdog": coordinator.locks().watchdog_running(),
        "activeAnalyses": coordinator.pipelines().active_sessions().len(),
        "intents": intents,
    }))
}

async fn stats_handler(
    State(state): State<Arc<WsState>>,
) -> Result<Json<LockStats>, (StatusCode, String)> {
    state
        .coordinator
        .locks()
        .get_lock_stats()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn document_locks_handler(
    State(state): State<Arc<WsState>>,
    AxumPath(document_id): AxumPath<String>,
) -> Result<Json<Vec<Lock>>, (StatusCode, String)> {
    state
        .coordinator
        .locks()
        .get_document_locks(&document_id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_core::{Actor, SessionKey};
    use coedit_engine::MemoryLockStore;

    fn state() -> Arc<WsState> {
        let coordinator =
            Coordinator::with_store(CoordinatorConfig::default(), Arc::new(MemoryLockStore::new()));
        Arc::new(WsState::new(Arc::new(coordinator)))
    }

    #[tokio::test]
    async fn document_locks_route_lists_live_locks() {
        let state = state();
        state
            .coordinator
            .locks()
            .acquire_locks(
                &["b1".to_string()],
                "doc",
                &SessionKey::new("s1"),
                &Actor::user("alice"),
                None,
            )
            .await;

        let Json(locks) = document_locks_handler(State(state.clone()), AxumPath("doc".into()))
            .await
            .unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].block_id, "b1");

        let Json(stats) = stats_handler(State(state)).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.human_held, 1);
    }

    #[test]
    fn router_builds() {
        let _ = build_router(state());
    }
}
