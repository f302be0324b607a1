use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tandem_core::{ClientMessage, ConnectionId, ServerMessage};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lobby::{Effects, Lobby, LobbyStats};
use crate::registry::{ConnectionRegistry, Registration};
use crate::relay::{Handshake, RelayOutcome};

/// Entry point for every connection event (connect, frame, disconnect).
///
/// Lobby mutations and the resulting deliveries happen under one lock; sends
/// only push onto unbounded channels, so nothing inside the critical section
/// waits on I/O.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    lobby: Mutex<Lobby>,
    connections: ConnectionRegistry,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> Registration {
        let registration = self.inner.connections.register();
        let stats = {
            let mut lobby = self.inner.lobby.lock();
            lobby.connect(registration.id);
            lobby.stats()
        };
        counter!("tandem_connections_total", 1);
        record_gauges(&stats);
        info!(connection_id = %registration.id, "connection registered");
        registration
    }

    pub fn handle(&self, id: ConnectionId, message: ClientMessage) {
        self.inner.connections.touch(id);
        let kind = message.kind();
        let (match_id, handshake) = match message {
            ClientMessage::EnterQueue => {
                self.mutate(|lobby| lobby.enter(id));
                return;
            }
            ClientMessage::LeaveQueue => {
                self.mutate(|lobby| {
                    lobby.leave_queue(id);
                    Effects::default()
                });
                return;
            }
            ClientMessage::LeaveMatch { match_id } => {
                self.mutate(|lobby| lobby.leave_match(id, &match_id));
                return;
            }
            ClientMessage::Ping => {
                self.inner.connections.send(id, ServerMessage::Pong);
                return;
            }
            ClientMessage::Offer { match_id, offer } => (match_id, Handshake::Offer(offer)),
            ClientMessage::Answer { match_id, answer } => (match_id, Handshake::Answer(answer)),
            ClientMessage::IceCandidate {
                match_id,
                candidate,
            } => (match_id, Handshake::IceCandidate(candidate)),
            ClientMessage::DeviceChange { match_id } => (match_id, Handshake::DeviceChange),
        };

        let lobby = self.inner.lobby.lock();
        match lobby.relay(id, &match_id, handshake) {
            RelayOutcome::Forward { to, message } => {
                if self.inner.connections.send(to, message) {
                    counter!("tandem_messages_relayed_total", 1, "kind" => kind);
                } else {
                    debug!(connection_id = %to, kind, "relay target already gone");
                }
            }
            RelayOutcome::Dropped(reason) => {
                debug!(
                    connection_id = %id,
                    match_id = %match_id,
                    kind,
                    reason = reason.metric_label(),
                    "dropping handshake message"
                );
                counter!(
                    "tandem_messages_dropped_total",
                    1,
                    "kind" => kind,
                    "reason" => reason.metric_label()
                );
            }
        }
    }

    /// Marks a connection as alive without changing any lobby state.
    pub fn touch(&self, id: ConnectionId) {
        self.inner.connections.touch(id);
    }

    /// Sends a message straight to one connection, bypassing the lobby.
    pub fn notify(&self, id: ConnectionId, message: ServerMessage) -> bool {
        self.inner.connections.send(id, message)
    }

    pub fn disconnect(&self, id: ConnectionId) {
        self.mutate(|lobby| lobby.disconnect(id));
        self.inner.connections.unregister(id);
        info!(connection_id = %id, "connection removed");
    }

    pub fn stats(&self) -> LobbyStats {
        self.inner.lobby.lock().stats()
    }

    /// Closes connections that have been silent for longer than `idle_timeout`.
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let idle = self.inner.connections.idle_connections(idle_timeout);
        for id in &idle {
            if self.inner.connections.close(*id) {
                counter!("tandem_idle_pruned_total", 1);
                info!(connection_id = %id, "closing idle connection");
            }
        }
        idle.len()
    }

    pub fn spawn_reaper(&self, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                broker.reap_idle(idle_timeout);
            }
        })
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut Lobby) -> Effects,
    {
        let mut lobby = self.inner.lobby.lock();
        let effects = f(&mut lobby);
        for outbound in effects.outbound {
            if !self.inner.connections.send(outbound.to, outbound.message) {
                debug!(connection_id = %outbound.to, "notification target already gone");
            }
        }
        if effects.created.is_some() {
            counter!("tandem_matches_created_total", 1);
        }
        if let Some((_, reason)) = effects.torn_down {
            counter!(
                "tandem_matches_torn_down_total",
                1,
                "reason" => reason.metric_label()
            );
        }
        let stats = lobby.stats();
        drop(lobby);
        record_gauges(&stats);
    }
}

fn record_gauges(stats: &LobbyStats) {
    gauge!("tandem_connections_active", stats.connections as f64);
    gauge!("tandem_queue_depth", stats.queued as f64);
    gauge!("tandem_matches_active", stats.active_matches as f64);
}
