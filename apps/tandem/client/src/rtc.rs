//! [`MediaTransport`] backed by a webrtc-rs peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_core::{IceCandidate, SdpType, SessionDescription};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::media::{LocalStream, TrackKind};
use crate::transport::{
    IceState, MediaTransport, RemoteTrack, TransportEvent, TransportEventSink, TransportFactory,
};

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }]
        };
        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<RtcTransport>, TransportError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let generation = events.generation();

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                        return;
                    };
                    sink.emit(TransportEvent::RemoteTrack(RemoteTrack {
                        kind,
                        id: track.id(),
                        stream_id: track.stream_id(),
                        track: Some(track),
                    }));
                })
            },
        ));

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(error = %err, "failed to serialise local candidate"),
                }
            })
        }));

        let sink = events;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(state) = ice_state(state) {
                    sink.emit(TransportEvent::IceStateChanged(state));
                }
            })
        }));

        debug!(generation, "peer connection created");
        Ok(Arc::new(RtcTransport { pc }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_local_tracks(&self, stream: &LocalStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            self.pc.add_track(track.rtc_track()).await?;
        }
        Ok(())
    }

    async fn replace_outgoing_tracks(&self, stream: &LocalStream) -> Result<(), TransportError> {
        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            let Some(kind) = TrackKind::from_codec_type(current.kind()) else {
                continue;
            };
            if let Some(next) = stream.track(kind) {
                sender.replace_track(Some(next.rtc_track())).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            return Err(TransportError::InvalidDescription(
                "rollback descriptions are not supported".into(),
            ))
        }
    };
    Ok(converted)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(TransportError::InvalidDescription(format!(
            "unexpected local description type {other}"
        ))),
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    let mapped = match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    };
    Some(mapped)
}
