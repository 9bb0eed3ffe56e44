//! WebSocket connection handling
//!
//! Every connection is its own session: it gets a fresh session key, sees
//! every coordination event on the bus, and receives the analysis events of
//! the analyses it started. Closing the socket releases the session's locks
//! and cancels its analysis.

use crate::rpc::{self, ConnectionContext};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use coedit_core::{AnalysisEvent, EventMessage, RpcRequest, RpcResponse, SessionKey, PARSE_ERROR};
use coedit_engine::Coordinator;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Analysis events buffered per connection before producers wait.
const ANALYSIS_BUFFER: usize = 256;

/// Shared state for WebSocket connections.
pub struct WsState {
    pub coordinator: Arc<Coordinator>,
    /// When the gateway started.
    pub started_at: std::time::Instant,
    connections: AtomicUsize,
}

impl WsState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            started_at: std::time::Instant::now(),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Handle a WebSocket connection until the client goes away.
pub async fn handle_connection(socket: WebSocket, state: Arc<WsState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let session = SessionKey::generate();
    state.connections.fetch_add(1, Ordering::Relaxed);
    info!(session = %session, "Client connected");

    let mut bus_rx = state.coordinator.events().subscribe();
    let (analysis_tx, mut analysis_rx) = mpsc::channel::<AnalysisEvent>(ANALYSIS_BUFFER);

    let info_event = EventMessage::info(env!("CARGO_PKG_VERSION"), session.as_str());
    if let Ok(json) = serde_json::to_string(&info_event) {
        let _ = ws_tx.send(WsMessage::Text(json)).await;
    }

    let ctx = ConnectionContext {
        session: session.clone(),
        coordinator: state.coordinator.clone(),
        analysis_tx,
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let response = handle_text_message(&text, &ctx).await;
                        if let Ok(json) = serde_json::to_string(&response) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) => {
                        if let Ok(json) = serde_json::to_string(&EventMessage::pong()) {
                            let _ = ws_tx.send(WsMessage::Text(json)).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session = %session, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        let msg = EventMessage::coordination(&event);
                        if let Ok(json) = serde_json::to_string(&msg) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session = %session, "Client lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed");
                        break;
                    }
                }
            }

            Some(event) = analysis_rx.recv() => {
                let msg = EventMessage::analysis(&event);
                if let Ok(json) = serde_json::to_string(&msg) {
                    if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.connections.fetch_sub(1, Ordering::Relaxed);
    match state.coordinator.disconnect_session(&session).await {
        Ok(report) => info!(
            session = %session,
            locks_released = report.locks_released,
            analysis_cancelled = report.analysis_cancelled,
            "Client disconnected"
        ),
        Err(e) => warn!(session = %session, "Disconnect cleanup failed: {}", e),
    }
}

/// Parse one text frame as an RPC request and answer it.
async fn handle_text_message(text: &str, ctx: &ConnectionContext) -> RpcResponse {
    match serde_json::from_str::<RpcRequest>(text) {
        Ok(req) => {
            debug!(session = %ctx.session, method = %req.method, "rpc");
            let result = rpc::route_rpc(&req.method, req.params, ctx).await;
            rpc::to_response(&req.id, result)
        }
        Err(e) => {
            let preview: String = text.chars().take(100).collect();
            warn!("Unparseable message: {}", preview);
            RpcResponse::err("", PARSE_ERROR, format!("Parse error: {}", e))
        }
    }
}
