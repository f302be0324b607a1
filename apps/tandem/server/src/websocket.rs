use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tandem_core::{decode_client_message, encode_message, ConnectionId, ServerMessage};
use tracing::{debug, warn};

use crate::AppState;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let broker = state.broker.clone();
    let registration = broker.connect();
    let connection_id = registration.id;
    let close = registration.close;
    let mut outbound = registration.receiver;
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match encode_message(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!(connection_id = %connection_id, "writer task finished");
    });

    loop {
        let frame = tokio::select! {
            _ = close.notified() => {
                debug!(connection_id = %connection_id, "server requested close");
                break;
            }
            frame = receiver.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if frame.is_ok() {
            // Every frame counts as activity, pings and garbage included.
            state.broker.touch(connection_id);
        }
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, connection_id, text.as_bytes()),
            Ok(Message::Binary(bytes)) => handle_frame(&state, connection_id, &bytes),
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket receive error");
                break;
            }
        }
    }

    // Dropping the registry entry ends the writer once queued frames flush.
    broker.disconnect(connection_id);
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        debug!(connection_id = %connection_id, "writer did not drain in time");
    }
}

fn handle_frame(state: &AppState, connection_id: ConnectionId, bytes: &[u8]) {
    match decode_client_message(bytes) {
        Ok(message) => {
            debug!(connection_id = %connection_id, kind = message.kind(), "frame received");
            state.broker.handle(connection_id, message);
        }
        Err(err) => {
            debug!(connection_id = %connection_id, error = %err, "unparseable frame");
            state.broker.notify(
                connection_id,
                ServerMessage::Error {
                    message: format!("invalid message format: {err}"),
                },
            );
        }
    }
}
