//! WebSocket connection lifecycle: greeting, read loop, write loop.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_core::protocol::{ClientMessage, ServerEvent};

use crate::session::{SessionCommand, SessionController};
use crate::state::{ConnectionState, GatewayState};

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    {
        let mut connections = state.connections.write().await;
        connections.insert(
            conn_id.clone(),
            ConnectionState {
                conn_id: conn_id.clone(),
                connected_at: chrono::Utc::now(),
            },
        );
    }

    send_event(&event_tx, ServerEvent::ConnectionReady);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let session = SessionController::spawn(&conn_id, state.session_deps(), event_tx.clone());

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let command = ClientMessage::parse(text.as_str()).and_then(|msg| {
                    debug!(conn_id = %conn_id, kind = msg.kind(), "Client message");
                    SessionCommand::try_from(msg)
                });
                match command {
                    Ok(command) => {
                        if !session.send(command).await {
                            warn!(conn_id = %conn_id, "Session stopped accepting commands");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "Invalid client message");
                        state.metrics.record_error(e.kind());
                        send_event(&event_tx, ServerEvent::processing_error(e.to_string()));
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                send_event(
                    &event_tx,
                    ServerEvent::processing_error("binary frames are not supported; send audio_chunk"),
                );
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Ends the session if the client left without stop_session.
    session.shutdown().await;
    drop(event_tx);
    if let Err(e) = send_task.await {
        debug!(conn_id = %conn_id, error = %e, "Send task ended abnormally");
    }
    state.connections.write().await.remove(&conn_id);
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

fn send_event(tx: &mpsc::UnboundedSender<String>, event: ServerEvent) {
    match event.stamp().to_json() {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => error!(error = %e, "Failed to serialize event"),
    }
}
