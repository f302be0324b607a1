use thiserror::Error;

/// Failures reported by a [`MediaTransport`](crate::transport::MediaTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("transport already closed")]
    Closed,
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// Local camera/microphone acquisition failures.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no device available for {0}")]
    NoDevice(&'static str),
    #[error("device {device_id} could not be opened: {reason}")]
    Unavailable { device_id: String, reason: String },
    #[error("track setup failed: {0}")]
    Track(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A negotiation step ran for the current match before any transport
    /// existed. The session is forced back to idle when this happens.
    #[error("no media transport exists for match {0}")]
    NoTransport(String),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
    #[error("a local device change is already in progress")]
    DeviceChangeInProgress,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}
