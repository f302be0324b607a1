use std::collections::HashMap;
use std::time::Instant;

use tandem_core::{ConnectionId, MatchId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the first offer.
    Initiator,
    /// Answers the initiator's offer.
    Responder,
}

#[derive(Debug, Clone)]
pub struct Match {
    pub id: MatchId,
    pub initiator: ConnectionId,
    pub responder: ConnectionId,
    pub created_at: Instant,
}

impl Match {
    pub fn role_of(&self, connection: ConnectionId) -> Option<Role> {
        if connection == self.initiator {
            Some(Role::Initiator)
        } else if connection == self.responder {
            Some(Role::Responder)
        } else {
            None
        }
    }

    /// The member that is not `connection`, if `connection` is a member.
    pub fn peer_of(&self, connection: ConnectionId) -> Option<ConnectionId> {
        match self.role_of(connection)? {
            Role::Initiator => Some(self.responder),
            Role::Responder => Some(self.initiator),
        }
    }

    pub fn members(&self) -> [ConnectionId; 2] {
        [self.initiator, self.responder]
    }
}

#[derive(Default)]
pub struct MatchRegistry {
    matches: HashMap<MatchId, Match>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new match with `initiator` waiting longest.
    pub fn create(&mut self, initiator: ConnectionId, responder: ConnectionId) -> Match {
        let record = Match {
            id: MatchId::derive(initiator, responder),
            initiator,
            responder,
            created_at: Instant::now(),
        };
        self.matches.insert(record.id.clone(), record.clone());
        record
    }

    pub fn get(&self, id: &MatchId) -> Option<&Match> {
        self.matches.get(id)
    }

    pub fn remove(&mut self, id: &MatchId) -> Option<Match> {
        self.matches.remove(id)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Match> {
        self.matches.values()
    }
}
