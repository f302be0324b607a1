//! The seam between the negotiation state machine and a peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_core::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::media::{LocalStream, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// Terminal for the current match: the session must be torn down.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            IceState::Disconnected | IceState::Failed | IceState::Closed
        )
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    pub stream_id: String,
    /// The live RTP track, when the transport is backed by a real peer
    /// connection.
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Media arriving from the peer, grouped as one stream.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub(crate) fn add(&mut self, track: RemoteTrack) {
        self.tracks.retain(|existing| existing.id != track.id);
        self.tracks.push(track);
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    RemoteTrack(RemoteTrack),
    LocalCandidate(IceCandidate),
    IceStateChanged(IceState),
}

/// A transport event stamped with the session generation that created the
/// transport, so events from a torn-down transport can be discarded.
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    pub generation: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEnvelope>,
}

impl TransportEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<TransportEnvelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the negotiator has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn add_local_tracks(&self, stream: &LocalStream) -> Result<(), TransportError>;
    /// Points every outgoing sender at the stream's track of the same kind.
    /// Senders whose kind is absent from `stream` are left alone.
    async fn replace_outgoing_tracks(&self, stream: &LocalStream) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: MediaTransport;

    /// Builds a fresh transport that reports its events through `events`.
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<Self::Transport>, TransportError>;
}
