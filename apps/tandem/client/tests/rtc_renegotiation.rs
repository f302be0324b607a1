use std::sync::Arc;

use tandem_client::rtc::RtcTransportFactory;
use tandem_client::{NegotiationError, Negotiator, SyntheticDevices, TransportEnvelope};
use tandem_core::{ClientMessage, ConnectionId, ServerMessage};
use tandem_server::broker::Broker;
use tokio::sync::mpsc;

type RtcNegotiator = Negotiator<RtcTransportFactory, SyntheticDevices>;

/// A peer with a real webrtc-rs transport, wired to an in-process broker.
struct RtcPeer {
    id: ConnectionId,
    negotiator: Arc<RtcNegotiator>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    _events: mpsc::UnboundedReceiver<TransportEnvelope>,
    sent: Vec<ClientMessage>,
    received: Vec<ServerMessage>,
    errors: Vec<String>,
}

impl RtcPeer {
    fn join(broker: &Broker) -> Self {
        let registration = broker.connect();
        let factory = RtcTransportFactory::new(Vec::new()).unwrap();
        let devices = SyntheticDevices::new(
            vec!["mic".into(), "mic-2".into()],
            vec!["cam".into()],
        );
        let (tx, outbound) = mpsc::unbounded_channel();
        let (negotiator, events) = Negotiator::new(factory, devices, tx);
        Self {
            id: registration.id,
            negotiator,
            outbound,
            inbound: registration.receiver,
            _events: events,
            sent: Vec::new(),
            received: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn flush(&mut self, broker: &Broker) -> usize {
        let mut moved = 0;
        while let Ok(message) = self.outbound.try_recv() {
            self.sent.push(message.clone());
            broker.handle(self.id, message);
            moved += 1;
        }
        moved
    }

    async fn deliver(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.inbound.try_recv() {
            self.received.push(message.clone());
            let result: Result<(), NegotiationError> =
                self.negotiator.handle_server_message(message).await;
            if let Err(err) = result {
                self.errors.push(err.to_string());
            }
            applied += 1;
        }
        applied
    }

    fn sent_of(&self, kind: &str) -> usize {
        self.sent.iter().filter(|m| m.kind() == kind).count()
    }
}

async fn settle(broker: &Broker, a: &mut RtcPeer, b: &mut RtcPeer) {
    loop {
        let progress =
            a.flush(broker) + b.flush(broker) + a.deliver().await + b.deliver().await;
        if progress == 0 {
            break;
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn peer_device_change_ahead_of_the_first_answer_keeps_the_match() {
    let broker = Broker::new();
    let mut a = RtcPeer::join(&broker);
    let mut b = RtcPeer::join(&broker);

    a.negotiator.enter_queue().unwrap();
    a.flush(&broker);
    b.negotiator.enter_queue().unwrap();
    b.flush(&broker);

    // A sends its first offer; B builds its transport and switches mics
    // before answering, so A hears about the change ahead of the answer.
    a.deliver().await;
    b.deliver().await;
    b.negotiator.change_audio_input("mic-2").await.unwrap();
    b.flush(&broker);
    a.flush(&broker);
    b.deliver().await;
    b.flush(&broker);
    a.deliver().await;

    let order: Vec<&'static str> = a
        .received
        .iter()
        .filter_map(|m| match m {
            ServerMessage::PeerDeviceChange { .. } => Some("device"),
            ServerMessage::Answer { .. } => Some("answer"),
            _ => None,
        })
        .collect();
    assert_eq!(order, ["device", "answer"]);

    settle(&broker, &mut a, &mut b).await;

    assert!(a.errors.is_empty(), "initiator errors: {:?}", a.errors);
    assert!(b.errors.is_empty(), "responder errors: {:?}", b.errors);
    assert_eq!(a.sent_of("offer"), 2);
    assert_eq!(b.sent_of("answer"), 2);
    assert_eq!(a.sent_of("leave_match"), 0);
    assert!(a.negotiator.state().in_match());
    assert!(b.negotiator.state().in_match());
    assert_eq!(a.negotiator.match_id(), b.negotiator.match_id());
    assert_eq!(broker.stats().active_matches, 1);

    a.negotiator.leave().await.unwrap();
    settle(&broker, &mut a, &mut b).await;
}
