//! WebSocket front end for the session registry.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use debatearena_core::{DebateError, SessionContext, SessionRegistry, Transport};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

/// Listen on the configured address until ctrl-c, then end every session.
pub async fn serve(ctx: SessionContext) -> Result<(), DebateError> {
    let bind = ctx.config.server.bind.clone();
    let state = AppState {
        transport: ctx.transport.clone(),
        registry: SessionRegistry::new(ctx),
    };
    let registry = state.registry.clone();

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, transport = state.transport.name(), "DebateArena listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for ctrl-c");
            }
        })
        .await?;

    registry.shutdown().await;
    info!("DebateArena stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> String {
    format!("ok sessions={}", state.registry.len())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subscription = state.transport.connect(connection).await;
    debug!(%connection, "Connection opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(%connection, error = %e, "Could not encode event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                warn!(%connection, error = %e, "WebSocket receive error");
                break;
            }
        };

        match message {
            Message::Text(text) => state.registry.handle_frame(connection, &text).await,
            Message::Binary(_) => {
                let err = DebateError::InvalidEvent("binary frames are not supported".to_string());
                state.registry.report_error(connection, &err).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Dropping the connection closes its queue, which ends the writer.
    state.registry.disconnect(connection).await;
    if let Err(e) = writer.await {
        warn!(%connection, error = %e, "Writer task failed");
    }
    debug!(%connection, "Connection closed");
}
