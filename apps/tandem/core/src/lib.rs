//! Wire types shared by the Tandem server and client.
//!
//! Both sides speak JSON text frames over a single WebSocket. Frames are
//! internally tagged by `type` and use camelCase field names so browser peers
//! can talk to the same endpoint without a translation layer.

mod ids;
mod protocol;

pub use ids::{ConnectionId, MatchId};
pub use protocol::{
    decode_client_message, decode_server_message, encode_message, ClientMessage, IceCandidate,
    ProtocolError, SdpType, ServerMessage, SessionDescription,
};
