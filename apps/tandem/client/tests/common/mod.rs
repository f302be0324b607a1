#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_client::{
    LocalStream, MediaDevices, MediaError, MediaRequest, MediaTransport, NegotiationError,
    NegotiationState, Negotiator, RemoteTrack, StateTransition, SyntheticDevices, TrackKind,
    TransportEnvelope, TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use tandem_core::{
    ClientMessage, ConnectionId, IceCandidate, SdpType, ServerMessage, SessionDescription,
};
use tandem_server::broker::Broker;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    AddTracks(Vec<String>),
    ReplaceTracks(Vec<String>),
    Close,
}

fn device_ids(stream: &LocalStream) -> Vec<String> {
    stream.tracks().map(|t| t.device_id().to_owned()).collect()
}

/// Records every call and pretends ICE connects as soon as both
/// descriptions are in place.
pub struct FakeTransport {
    sink: TransportEventSink,
    calls: Mutex<Vec<Call>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    serial: AtomicUsize,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn emit(&self, event: TransportEvent) {
        self.sink.emit(event);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn maybe_connect(&self) {
        if self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            self.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 1 10.0.0.1 9 typ host",
                    self.sink.generation()
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
            self.emit(TransportEvent::RemoteTrack(RemoteTrack {
                kind: TrackKind::Video,
                id: "remote-video".into(),
                stream_id: "remote".into(),
                track: None,
            }));
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer);
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("answer-{n}")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(Call::SetLocal(description.kind));
        self.has_local.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(Call::SetRemote(description.kind));
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_local_tracks(&self, stream: &LocalStream) -> Result<(), TransportError> {
        self.record(Call::AddTracks(device_ids(stream)));
        Ok(())
    }

    async fn replace_outgoing_tracks(&self, stream: &LocalStream) -> Result<(), TransportError> {
        self.record(Call::ReplaceTracks(device_ids(stream)));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        self.emit(TransportEvent::IceStateChanged(tandem_client::IceState::Closed));
        Ok(())
    }
}

#[derive(Default)]
struct FactoryInner {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

#[derive(Clone, Default)]
pub struct FakeFactory {
    inner: Arc<FactoryInner>,
}

impl FakeFactory {
    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.inner.created.lock().clone()
    }

    pub fn latest(&self) -> Arc<FakeTransport> {
        self.inner
            .created
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    /// The next `create` blocks until the returned notify fires.
    pub fn hold_next_create(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.inner.gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<FakeTransport>, TransportError> {
        let gate = self.inner.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let transport = Arc::new(FakeTransport {
            sink: events,
            calls: Mutex::new(Vec::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            serial: AtomicUsize::new(0),
        });
        self.inner.created.lock().push(transport.clone());
        Ok(transport)
    }
}

struct DevicesInner {
    synthetic: SyntheticDevices,
    requests: Mutex<Vec<MediaRequest>>,
    acquired: Mutex<Vec<LocalStream>>,
    broken: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

#[derive(Clone)]
pub struct FakeDevices {
    inner: Arc<DevicesInner>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            inner: Arc::new(DevicesInner {
                synthetic: SyntheticDevices::new(
                    vec!["mic".into(), "mic-2".into(), "mic-broken".into()],
                    vec!["cam".into(), "cam-2".into(), "cam-broken".into()],
                ),
                requests: Mutex::new(Vec::new()),
                acquired: Mutex::new(Vec::new()),
                broken: Mutex::new(vec!["mic-broken".into(), "cam-broken".into()]),
                gate: Mutex::new(None),
            }),
        }
    }
}

impl FakeDevices {
    pub fn requests(&self) -> Vec<MediaRequest> {
        self.inner.requests.lock().clone()
    }

    /// Every stream handed out so far, in order.
    pub fn acquired(&self) -> Vec<LocalStream> {
        self.inner.acquired.lock().clone()
    }

    pub fn hold_next_acquire(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.inner.gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream, MediaError> {
        self.inner.requests.lock().push(request.clone());
        let gate = self.inner.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(tandem_client::DeviceSelector::Exact(id)) = request.selector(kind) {
                if self.inner.broken.lock().contains(id) {
                    return Err(MediaError::Unavailable {
                        device_id: id.clone(),
                        reason: "device busy".into(),
                    });
                }
            }
        }
        let stream = self.inner.synthetic.acquire(request).await?;
        self.inner.acquired.lock().push(stream.clone());
        Ok(stream)
    }
}

pub type TestNegotiator = Negotiator<FakeFactory, FakeDevices>;

/// One client wired to an in-process broker through plain channels.
pub struct Peer {
    pub id: ConnectionId,
    pub negotiator: Arc<TestNegotiator>,
    pub factory: FakeFactory,
    pub devices: FakeDevices,
    pub transitions: mpsc::UnboundedReceiver<StateTransition>,
    pub sent: Vec<ClientMessage>,
    pub received: Vec<ServerMessage>,
    pub errors: Vec<String>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    events: mpsc::UnboundedReceiver<TransportEnvelope>,
}

impl Peer {
    pub fn join(broker: &Broker) -> Self {
        let registration = broker.connect();
        let factory = FakeFactory::default();
        let devices = FakeDevices::default();
        let (tx, outbound) = mpsc::unbounded_channel();
        let (negotiator, events) = Negotiator::new(factory.clone(), devices.clone(), tx);
        let transitions = negotiator.subscribe();
        Self {
            id: registration.id,
            negotiator,
            factory,
            devices,
            transitions,
            sent: Vec::new(),
            received: Vec::new(),
            errors: Vec::new(),
            outbound,
            inbound: registration.receiver,
            events,
        }
    }

    /// Hands everything this peer has written to the broker.
    pub fn flush(&mut self, broker: &Broker) -> usize {
        let mut moved = 0;
        while let Ok(message) = self.outbound.try_recv() {
            self.sent.push(message.clone());
            broker.handle(self.id, message);
            moved += 1;
        }
        moved
    }

    pub fn next_inbound(&mut self) -> Option<ServerMessage> {
        let message = self.inbound.try_recv().ok()?;
        self.received.push(message.clone());
        Some(message)
    }

    /// Applies queued server frames and transport events.
    pub async fn deliver(&mut self) -> usize {
        let mut applied = 0;
        while let Some(message) = self.next_inbound() {
            let result = self.negotiator.handle_server_message(message).await;
            self.record(result);
            applied += 1;
        }
        while let Ok(envelope) = self.events.try_recv() {
            let result = self.negotiator.handle_transport_event(envelope).await;
            self.record(result);
            applied += 1;
        }
        applied
    }

    pub fn drain_transitions(&mut self) -> Vec<(NegotiationState, NegotiationState)> {
        let mut seen = Vec::new();
        while let Ok(change) = self.transitions.try_recv() {
            seen.push((change.from, change.to));
        }
        seen
    }

    pub fn sent_of(&self, kind: &str) -> Vec<&ClientMessage> {
        self.sent.iter().filter(|m| m.kind() == kind).collect()
    }

    pub fn received_of(&self, predicate: impl Fn(&ServerMessage) -> bool) -> usize {
        self.received.iter().filter(|m| predicate(m)).count()
    }

    fn record(&mut self, result: Result<(), NegotiationError>) {
        if let Err(err) = result {
            self.errors.push(err.to_string());
        }
    }
}

/// Runs every peer until no frame or event is left in flight.
pub async fn settle(broker: &Broker, peers: &mut [&mut Peer]) {
    loop {
        let mut progress = 0;
        for peer in peers.iter_mut() {
            progress += peer.flush(broker);
            progress += peer.deliver().await;
        }
        if progress == 0 {
            break;
        }
    }
}

/// Queues `a` then `b` and settles until both are connected.
pub async fn connect_pair(broker: &Broker, a: &mut Peer, b: &mut Peer) {
    a.negotiator.enter_queue().unwrap();
    settle(broker, &mut [&mut *a]).await;
    b.negotiator.enter_queue().unwrap();
    settle(broker, &mut [&mut *a, &mut *b]).await;
}
