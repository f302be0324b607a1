//! WebSocket connection to the Tandem signaling server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_core::{decode_server_message, encode_message, ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::SignalingError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keeps the server's idle reaper away from quiet but healthy clients.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A live signaling connection. Frames written to `outbound` go to the
/// server; parsed server frames arrive on `inbound`, which closes when the
/// socket does. Dropping the connection stops both pumps.
pub struct SignalingConnection {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
    task: Option<JoinHandle<()>>,
}

impl SignalingConnection {
    pub async fn connect(server: &str) -> Result<Self, SignalingError> {
        Self::connect_with_keepalive(server, Some(KEEPALIVE_INTERVAL)).await
    }

    pub async fn connect_with_keepalive(
        server: &str,
        keepalive: Option<Duration>,
    ) -> Result<Self, SignalingError> {
        let url = Url::parse(server)
            .map_err(|err| SignalingError::InvalidUrl(format!("{server}: {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "{server}: expected a ws:// or wss:// url"
            )));
        }

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        debug!(%url, "signaling connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(socket, outbound_rx, inbound_tx, keepalive));

        Ok(Self {
            outbound,
            inbound,
            task: Some(task),
        })
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn pump(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    keepalive: Option<Duration>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        let mut ticker = keepalive.map(tokio::time::interval);
        loop {
            let message = match ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    message = outbound.recv() => message,
                    _ = ticker.tick() => Some(ClientMessage::Ping),
                },
                None => outbound.recv().await,
            };
            let Some(message) = message else {
                break;
            };
            let text = match encode_message(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode signaling frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(frame) = ws_receiver.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => decode_server_message(text.as_bytes()),
            Ok(Message::Binary(bytes)) => decode_server_message(&bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "signaling socket error");
                break;
            }
        };
        match decoded {
            Ok(message) => {
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "unparseable signaling frame"),
        }
    }

    debug!("signaling socket closed");
    send_task.abort();
    let _ = send_task.await;
}
