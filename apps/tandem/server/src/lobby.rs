use std::collections::HashMap;

use tandem_core::{ConnectionId, MatchId, ServerMessage};
use tracing::{debug, info};

use crate::matches::{Match, MatchRegistry};
use crate::queue::WaitQueue;
use crate::relay::{self, Handshake, RelayOutcome};

/// Where a connection currently stands. Queue membership and match
/// membership share one field, so a connection can never be in both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Idle,
    Queued,
    Matched(MatchId),
}

/// A message the caller must deliver after a lobby mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Outbound {
    fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    Disconnected,
    Left,
}

impl TeardownReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TeardownReason::Disconnected => "disconnected",
            TeardownReason::Left => "left",
        }
    }
}

/// Result of a single lobby operation.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub created: Option<MatchId>,
    pub torn_down: Option<(MatchId, TeardownReason)>,
}

impl Effects {
    fn none() -> Self {
        Self::default()
    }

    fn send(to: ConnectionId, message: ServerMessage) -> Self {
        Self {
            outbound: vec![Outbound::new(to, message)],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyStats {
    pub connections: usize,
    pub queued: usize,
    pub active_matches: usize,
}

/// Queue, match table and per-connection membership.
///
/// Every method runs to completion without awaiting, so callers serialise
/// them behind one lock and pairing, match creation and teardown are
/// observed atomically.
#[derive(Default)]
pub struct Lobby {
    queue: WaitQueue,
    matches: MatchRegistry,
    members: HashMap<ConnectionId, Membership>,
}

impl Lobby {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, id: ConnectionId) {
        self.members.entry(id).or_insert(Membership::Idle);
    }

    pub fn membership(&self, id: ConnectionId) -> Option<&Membership> {
        self.members.get(&id)
    }

    pub fn get_match(&self, id: &MatchId) -> Option<&Match> {
        self.matches.get(id)
    }

    pub fn stats(&self) -> LobbyStats {
        LobbyStats {
            connections: self.members.len(),
            queued: self.queue.len(),
            active_matches: self.matches.len(),
        }
    }

    /// Pairs `id` with the longest-waiting connection, or queues it.
    pub fn enter(&mut self, id: ConnectionId) -> Effects {
        match self.members.get(&id) {
            Some(Membership::Idle) => {}
            Some(Membership::Queued) => return Effects::none(),
            Some(Membership::Matched(match_id)) => {
                debug!(connection_id = %id, match_id = %match_id, "enter ignored while matched");
                return Effects::none();
            }
            None => return Effects::none(),
        }

        let Some(waiting) = self.queue.pop_front() else {
            self.queue.push_back(id);
            self.members.insert(id, Membership::Queued);
            return Effects::send(id, ServerMessage::Queued);
        };

        let record = self.matches.create(waiting, id);
        self.members
            .insert(waiting, Membership::Matched(record.id.clone()));
        self.members.insert(id, Membership::Matched(record.id.clone()));
        info!(
            match_id = %record.id,
            initiator = %waiting,
            responder = %id,
            "match created"
        );

        Effects {
            outbound: vec![
                Outbound::new(
                    waiting,
                    ServerMessage::Matched {
                        match_id: record.id.clone(),
                        initiator: true,
                    },
                ),
                Outbound::new(
                    id,
                    ServerMessage::Matched {
                        match_id: record.id.clone(),
                        initiator: false,
                    },
                ),
            ],
            created: Some(record.id),
            torn_down: None,
        }
    }

    pub fn leave_queue(&mut self, id: ConnectionId) {
        if self.queue.remove(id) {
            self.members.insert(id, Membership::Idle);
        }
    }

    pub fn relay(
        &self,
        sender: ConnectionId,
        match_id: &MatchId,
        handshake: Handshake,
    ) -> RelayOutcome {
        relay::route(&self.matches, match_id, sender, handshake)
    }

    /// A member ends the match on purpose; non-members are ignored.
    pub fn leave_match(&mut self, id: ConnectionId, match_id: &MatchId) -> Effects {
        let is_member = self
            .matches
            .get(match_id)
            .is_some_and(|record| record.role_of(id).is_some());
        if !is_member {
            return Effects::none();
        }
        self.teardown(match_id, id, TeardownReason::Left)
    }

    /// Removes the match and tells the member other than `departed`.
    /// Calling it again for the same match is a no-op.
    pub fn teardown(
        &mut self,
        match_id: &MatchId,
        departed: ConnectionId,
        reason: TeardownReason,
    ) -> Effects {
        let Some(record) = self.matches.remove(match_id) else {
            return Effects::none();
        };
        let mut outbound = Vec::with_capacity(1);
        for member in record.members() {
            if let Some(membership) = self.members.get_mut(&member) {
                *membership = Membership::Idle;
            }
            if member != departed {
                outbound.push(Outbound::new(
                    member,
                    ServerMessage::PeerDisconnected {
                        match_id: match_id.clone(),
                    },
                ));
            }
        }
        info!(
            match_id = %match_id,
            departed = %departed,
            reason = reason.metric_label(),
            "match torn down"
        );
        Effects {
            outbound,
            created: None,
            torn_down: Some((match_id.clone(), reason)),
        }
    }

    /// Drops every trace of `id`: queue slot, match (notifying the peer) and
    /// membership record.
    pub fn disconnect(&mut self, id: ConnectionId) -> Effects {
        let effects = match self.members.get(&id).cloned() {
            Some(Membership::Queued) => {
                self.queue.remove(id);
                Effects::none()
            }
            Some(Membership::Matched(match_id)) => {
                self.teardown(&match_id, id, TeardownReason::Disconnected)
            }
            Some(Membership::Idle) | None => Effects::none(),
        };
        self.members.remove(&id);
        effects
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (id, membership) in &self.members {
            match membership {
                Membership::Idle => {
                    assert!(!self.queue.contains(*id), "{id} idle but queued");
                }
                Membership::Queued => {
                    assert!(self.queue.contains(*id), "{id} marked queued but not in queue");
                }
                Membership::Matched(match_id) => {
                    assert!(!self.queue.contains(*id), "{id} matched and queued");
                    let record = self.matches.get(match_id).expect("match record exists");
                    assert!(record.role_of(*id).is_some());
                }
            }
        }
        for queued in self.queue.iter() {
            assert_eq!(self.members.get(&queued), Some(&Membership::Queued));
        }
        for record in self.matches.iter() {
            for member in record.members() {
                assert_eq!(
                    self.members.get(&member),
                    Some(&Membership::Matched(record.id.clone()))
                );
            }
        }
    }
}
