//! Local capture tracks and the device seam used to acquire them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;

const STREAM_ID: &str = "tandem-local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub(crate) fn from_codec_type(codec: RTPCodecType) -> Option<Self> {
        match codec {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured track. Clones share the same underlying RTP track and
/// liveness flag, so stopping any clone stops them all.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    device_id: String,
    track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        device_id: impl Into<String>,
        track: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            track,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Releases the capture device. Idempotent.
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// At most one audio and one video track.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalStream {
    pub fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self { audio, video }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    /// Returns a copy of this stream with the track of `track.kind()`
    /// swapped for `track`. The other kind is carried over untouched.
    pub fn with_track(&self, track: LocalTrack) -> Self {
        let mut next = self.clone();
        match track.kind() {
            TrackKind::Audio => next.audio = Some(track),
            TrackKind::Video => next.video = Some(track),
        }
        next
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    #[default]
    Default,
    Exact(String),
}

/// Which devices to open. A `None` kind is not captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: Option<DeviceSelector>,
    pub video: Option<DeviceSelector>,
}

impl MediaRequest {
    pub fn default_devices() -> Self {
        Self {
            audio: Some(DeviceSelector::Default),
            video: Some(DeviceSelector::Default),
        }
    }

    pub fn only(kind: TrackKind, device_id: impl Into<String>) -> Self {
        let selector = Some(DeviceSelector::Exact(device_id.into()));
        match kind {
            TrackKind::Audio => Self {
                audio: selector,
                video: None,
            },
            TrackKind::Video => Self {
                audio: None,
                video: selector,
            },
        }
    }

    pub fn selector(&self, kind: TrackKind) -> Option<&DeviceSelector> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream, MediaError>;
}

/// Device set backed by sample tracks that carry no captured media. Used by
/// the headless peer binary and anywhere a real capture stack is missing.
pub struct SyntheticDevices {
    audio_inputs: Vec<String>,
    video_inputs: Vec<String>,
    next_track: AtomicU64,
}

impl SyntheticDevices {
    pub fn new(audio_inputs: Vec<String>, video_inputs: Vec<String>) -> Self {
        Self {
            audio_inputs,
            video_inputs,
            next_track: AtomicU64::new(0),
        }
    }

    fn inputs(&self, kind: TrackKind) -> &[String] {
        match kind {
            TrackKind::Audio => &self.audio_inputs,
            TrackKind::Video => &self.video_inputs,
        }
    }

    fn open(&self, kind: TrackKind, selector: &DeviceSelector) -> Result<LocalTrack, MediaError> {
        let inputs = self.inputs(kind);
        let device_id = match selector {
            DeviceSelector::Default => inputs.first().ok_or(MediaError::NoDevice(kind.as_str()))?,
            DeviceSelector::Exact(wanted) => {
                inputs
                    .iter()
                    .find(|id| *id == wanted)
                    .ok_or_else(|| MediaError::Unavailable {
                        device_id: wanted.clone(),
                        reason: format!("no such {kind} input"),
                    })?
            }
        };

        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let serial = self.next_track.fetch_add(1, Ordering::Relaxed);
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            format!("{kind}-{serial}"),
            STREAM_ID.to_owned(),
        );
        Ok(LocalTrack::new(kind, device_id.clone(), Arc::new(track)))
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new(vec!["default-mic".into()], vec!["default-camera".into()])
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream, MediaError> {
        let mut stream = LocalStream::default();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(selector) = request.selector(kind) {
                stream = stream.with_track(self.open(kind, selector)?);
            }
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn default_request_opens_both_kinds() {
        let devices = SyntheticDevices::default();
        let stream = devices
            .acquire(&MediaRequest::default_devices())
            .await
            .unwrap();
        assert_eq!(stream.tracks().count(), 2);
        assert_eq!(stream.track(TrackKind::Audio).unwrap().device_id(), "default-mic");
        assert_eq!(stream.track(TrackKind::Video).unwrap().device_id(), "default-camera");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_device_is_reported() {
        let devices = SyntheticDevices::default();
        let err = devices
            .acquire(&MediaRequest::only(TrackKind::Video, "usb-cam"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Unavailable { device_id, .. } if device_id == "usb-cam"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn swapping_one_kind_keeps_the_other() {
        let devices =
            SyntheticDevices::new(vec!["mic".into()], vec!["cam-a".into(), "cam-b".into()]);
        let stream = devices
            .acquire(&MediaRequest::default_devices())
            .await
            .unwrap();
        let fresh = devices
            .acquire(&MediaRequest::only(TrackKind::Video, "cam-b"))
            .await
            .unwrap();
        let video = fresh.track(TrackKind::Video).unwrap().clone();

        let merged = stream.with_track(video);
        assert_eq!(merged.track(TrackKind::Video).unwrap().device_id(), "cam-b");
        assert_eq!(merged.track(TrackKind::Audio).unwrap().device_id(), "mic");
    }

    #[test_timeout::timeout]
    fn stopping_a_clone_stops_the_shared_track() {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio-0".into(),
            STREAM_ID.into(),
        ));
        let original = LocalTrack::new(TrackKind::Audio, "mic", track);
        let copy = original.clone();
        copy.stop();
        assert!(!original.is_live());
    }
}
