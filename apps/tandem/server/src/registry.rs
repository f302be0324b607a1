use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tandem_core::{ConnectionId, ServerMessage};
use tokio::sync::{mpsc, Notify};

/// Live WebSocket connections keyed by their server-assigned id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<ServerMessage>,
    last_activity: AtomicU64,
    close: Arc<Notify>,
}

pub struct Registration {
    pub id: ConnectionId,
    pub receiver: mpsc::UnboundedReceiver<ServerMessage>,
    /// Fires when the server wants the socket closed (idle reaping).
    pub close: Arc<Notify>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Registration {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());
        self.connections.insert(
            id,
            ConnectionHandle {
                sender,
                last_activity: AtomicU64::new(now_millis()),
                close: Arc::clone(&close),
            },
        );
        Registration {
            id,
            receiver,
            close,
        }
    }

    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    /// Queues `message` for the connection's writer task. Never blocks.
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> bool {
        match self.connections.get(&id) {
            Some(handle) => handle.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(handle) = self.connections.get(&id) {
            handle.last_activity.store(now_millis(), Ordering::Relaxed);
        }
    }

    pub fn idle_connections(&self, idle_timeout: Duration) -> Vec<ConnectionId> {
        let now = now_millis();
        let limit = idle_timeout.as_millis() as u64;
        self.connections
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)) > limit)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Asks the connection's socket loop to shut down.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(handle) => {
                handle.close.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
