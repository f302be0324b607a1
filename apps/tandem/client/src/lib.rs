//! Client half of Tandem: the negotiation state machine, the signaling
//! connection that feeds it, and a webrtc-rs media transport.

pub mod driver;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use driver::drive;
pub use error::{MediaError, NegotiationError, SignalingError, TransportError};
pub use media::{
    DeviceSelector, LocalStream, LocalTrack, MediaDevices, MediaRequest, SyntheticDevices,
    TrackKind,
};
pub use negotiation::{NegotiationState, Negotiator, Role, StateTransition};
pub use signaling::SignalingConnection;
pub use transport::{
    IceState, MediaTransport, RemoteStream, RemoteTrack, TransportEnvelope, TransportEvent,
    TransportEventSink, TransportFactory,
};
