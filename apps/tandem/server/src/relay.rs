use tandem_core::{ConnectionId, IceCandidate, MatchId, ServerMessage, SessionDescription};

use crate::matches::{MatchRegistry, Role};

/// Handshake payloads the relay forwards between match members.
#[derive(Debug, Clone)]
pub enum Handshake {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    DeviceChange,
}

impl Handshake {
    pub fn kind(&self) -> &'static str {
        match self {
            Handshake::Offer(_) => "offer",
            Handshake::Answer(_) => "answer",
            Handshake::IceCandidate(_) => "ice_candidate",
            Handshake::DeviceChange => "device_change",
        }
    }

    fn into_server_message(self, match_id: MatchId) -> ServerMessage {
        match self {
            Handshake::Offer(offer) => ServerMessage::Offer { match_id, offer },
            Handshake::Answer(answer) => ServerMessage::Answer { match_id, answer },
            Handshake::IceCandidate(candidate) => ServerMessage::IceCandidate {
                match_id,
                candidate,
            },
            Handshake::DeviceChange => ServerMessage::PeerDeviceChange { match_id },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownMatch,
    NotAMember,
    WrongRole,
}

impl DropReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DropReason::UnknownMatch => "unknown_match",
            DropReason::NotAMember => "not_a_member",
            DropReason::WrongRole => "wrong_role",
        }
    }
}

#[derive(Debug)]
pub enum RelayOutcome {
    Forward {
        to: ConnectionId,
        message: ServerMessage,
    },
    Dropped(DropReason),
}

/// Decides where a handshake message goes. Offers only travel
/// initiator→responder and answers responder→initiator; candidates and device
/// notices go to whichever member did not send them. Anything else is dropped
/// without telling the sender, since races with teardown produce such frames
/// legitimately.
pub fn route(
    matches: &MatchRegistry,
    match_id: &MatchId,
    sender: ConnectionId,
    handshake: Handshake,
) -> RelayOutcome {
    let Some(record) = matches.get(match_id) else {
        return RelayOutcome::Dropped(DropReason::UnknownMatch);
    };
    let Some(role) = record.role_of(sender) else {
        return RelayOutcome::Dropped(DropReason::NotAMember);
    };

    let allowed = match (&handshake, role) {
        (Handshake::Offer(_), Role::Initiator) | (Handshake::Answer(_), Role::Responder) => true,
        (Handshake::Offer(_), Role::Responder) | (Handshake::Answer(_), Role::Initiator) => false,
        (Handshake::IceCandidate(_), _) | (Handshake::DeviceChange, _) => true,
    };
    if !allowed {
        return RelayOutcome::Dropped(DropReason::WrongRole);
    }

    let to = match role {
        Role::Initiator => record.responder,
        Role::Responder => record.initiator,
    };
    RelayOutcome::Forward {
        to,
        message: handshake.into_server_message(match_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MatchRegistry, MatchId, ConnectionId, ConnectionId) {
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let mut registry = MatchRegistry::new();
        let id = registry.create(a, b).id;
        (registry, id, a, b)
    }

    #[test_timeout::timeout]
    fn offer_from_initiator_reaches_responder() {
        let (registry, id, a, b) = setup();
        match route(&registry, &id, a, Handshake::Offer(SessionDescription::offer("v=0"))) {
            RelayOutcome::Forward { to, message } => {
                assert_eq!(to, b);
                assert!(matches!(message, ServerMessage::Offer { .. }));
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn offer_from_responder_is_dropped() {
        let (registry, id, _a, b) = setup();
        let outcome = route(&registry, &id, b, Handshake::Offer(SessionDescription::offer("v=0")));
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::WrongRole)));
    }

    #[test_timeout::timeout]
    fn answer_from_initiator_is_dropped() {
        let (registry, id, a, _b) = setup();
        let answer = Handshake::Answer(SessionDescription::answer("v=0"));
        let outcome = route(&registry, &id, a, answer);
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::WrongRole)));
    }

    #[test_timeout::timeout]
    fn candidates_and_device_changes_cross_in_both_directions() {
        let (registry, id, a, b) = setup();
        for (sender, expected) in [(a, b), (b, a)] {
            match route(&registry, &id, sender, Handshake::IceCandidate(IceCandidate::default())) {
                RelayOutcome::Forward { to, .. } => assert_eq!(to, expected),
                other => panic!("expected forward, got {other:?}"),
            }
            match route(&registry, &id, sender, Handshake::DeviceChange) {
                RelayOutcome::Forward { to, message } => {
                    assert_eq!(to, expected);
                    assert_eq!(message, ServerMessage::PeerDeviceChange { match_id: id.clone() });
                }
                other => panic!("expected forward, got {other:?}"),
            }
        }
    }

    #[test_timeout::timeout]
    fn strangers_and_unknown_matches_are_dropped() {
        let (registry, id, _a, _b) = setup();
        let outcome = route(&registry, &id, ConnectionId::new(), Handshake::DeviceChange);
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::NotAMember)));

        let gone = MatchId::from("gone");
        let outcome = route(&registry, &gone, ConnectionId::new(), Handshake::DeviceChange);
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::UnknownMatch)));
    }
}
