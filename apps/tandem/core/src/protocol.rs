use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MatchId;

/// Session description in the shape browsers emit (`{ type, sdp }`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Trickled ICE candidate, matching `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Frames sent by a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    EnterQueue,
    LeaveQueue,
    /// Voluntarily end the current match; the peer sees `peerDisconnected`.
    #[serde(rename_all = "camelCase")]
    LeaveMatch { match_id: MatchId },
    #[serde(rename_all = "camelCase")]
    Offer {
        match_id: MatchId,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        match_id: MatchId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        match_id: MatchId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    DeviceChange { match_id: MatchId },
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::EnterQueue => "enter_queue",
            ClientMessage::LeaveQueue => "leave_queue",
            ClientMessage::LeaveMatch { .. } => "leave_match",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::DeviceChange { .. } => "device_change",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Frames sent by the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Queued,
    #[serde(rename_all = "camelCase")]
    Matched { match_id: MatchId, initiator: bool },
    #[serde(rename_all = "camelCase")]
    Offer {
        match_id: MatchId,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        match_id: MatchId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        match_id: MatchId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    PeerDeviceChange { match_id: MatchId },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { match_id: MatchId },
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn match_id(&self) -> Option<&MatchId> {
        match self {
            ServerMessage::Matched { match_id, .. }
            | ServerMessage::Offer { match_id, .. }
            | ServerMessage::Answer { match_id, .. }
            | ServerMessage::IceCandidate { match_id, .. }
            | ServerMessage::PeerDeviceChange { match_id }
            | ServerMessage::PeerDisconnected { match_id } => Some(match_id),
            ServerMessage::Queued | ServerMessage::Pong | ServerMessage::Error { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
}

pub fn decode_client_message(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

pub fn decode_server_message(bytes: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}
