//! Локальные и удалённые медиапотоки.

use crate::config::CallConfig;
use crate::error::{CaptureError, Result};
use crate::logger::{log, warn};
use crate::peer::types::CallKind;
use crate::utils::random_id;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

/// Что запрашиваем у устройства захвата
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Звук всегда; для видеозвонка ещё и камера с фиксированным разрешением
    pub fn for_call(kind: CallKind, config: &CallConfig) -> Self {
        Self {
            audio: true,
            video: match kind {
                CallKind::Voice => None,
                CallKind::Video => Some(VideoConstraints {
                    width: config.video_width,
                    height: config.video_height,
                }),
            },
        }
    }
}

/// Локальный трек захвата.
///
/// Источник пишет сэмплы через [`LocalTrack::write_sample`]; выключенный или
/// остановленный трек их отбрасывает.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = format!(
            "{}-{}",
            match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            },
            random_id()
        );
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            log(&format!("Local track {} stopped", self.id));
        }
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(());
        }
        self.rtc.write_sample(sample).await?;
        Ok(())
    }
}

/// Поток с устройства захвата
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Результат захвата: поток получен или недоступен (звонок продолжается без него)
#[derive(Debug, Clone)]
pub enum LocalMedia {
    Obtained(LocalStream),
    Unavailable(CaptureError),
}

impl LocalMedia {
    pub fn stream(&self) -> Option<&LocalStream> {
        match self {
            LocalMedia::Obtained(stream) => Some(stream),
            LocalMedia::Unavailable(_) => None,
        }
    }

    pub fn is_obtained(&self) -> bool {
        matches!(self, LocalMedia::Obtained(_))
    }
}

/// Платформенный доступ к камере и микрофону
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn request_capture(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalStream, CaptureError>;
}

/// Запрашивает камеру/микрофон под тип звонка. Никогда не падает:
/// отсутствие устройств или отказ в доступе дают `LocalMedia::Unavailable`.
pub async fn acquire_local_media(
    devices: Option<&dyn MediaDevices>,
    kind: CallKind,
    config: &CallConfig,
) -> LocalMedia {
    let Some(devices) = devices else {
        warn("No media devices on this platform, continuing without local stream");
        return LocalMedia::Unavailable(CaptureError::Unsupported);
    };

    let constraints = MediaConstraints::for_call(kind, config);
    match devices.request_capture(&constraints).await {
        Ok(stream) => {
            log(&format!(
                "Local stream {} acquired with {} track(s)",
                stream.id(),
                stream.tracks().len()
            ));
            LocalMedia::Obtained(stream)
        }
        Err(e) => {
            warn(&format!("Media capture failed, continuing without local stream: {e}"));
            LocalMedia::Unavailable(e)
        }
    }
}

/// Устройства без реального железа: отдают пустые Opus/VP8 треки под ограничения.
/// Данные в них пишет вызывающий код.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    deny: AtomicBool,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Имитирует отказ пользователя в доступе
    pub fn set_permission_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn request_capture(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalStream, CaptureError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied);
        }

        let stream_id = format!("local-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio, &stream_id)));
        }
        if let Some(video) = constraints.video {
            log(&format!("Synthetic camera at {}x{}", video.width, video.height));
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video, &stream_id)));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }
}

/// Трек собеседника
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Источник RTP, если соединение настоящее
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Общий удалённый поток; треки добавляются по мере прихода в любом порядке
#[derive(Debug, Default)]
pub struct RemoteStream {
    tracks: Mutex<Vec<RemoteTrack>>,
}

impl RemoteStream {
    /// Добавляет трек; повтор с тем же id игнорируется
    pub fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.lock().unwrap_or_else(|e| e.into_inner());
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        log(&format!(
            "Remote {:?} track {} added (stream {})",
            track.kind, track.id, track.stream_id
        ));
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn video_call_gets_audio_and_video() {
        let devices = SyntheticDevices::new();
        let media =
            acquire_local_media(Some(&devices), CallKind::Video, &CallConfig::default()).await;
        let stream = media.stream().unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
    }

    #[tokio::test]
    async fn voice_call_is_audio_only() {
        let devices = SyntheticDevices::new();
        let media =
            acquire_local_media(Some(&devices), CallKind::Voice, &CallConfig::default()).await;
        let stream = media.stream().unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.tracks()[0].kind(), TrackKind::Audio);
    }

    #[tokio::test]
    async fn denied_permission_degrades_instead_of_failing() {
        let devices = SyntheticDevices::new();
        devices.set_permission_denied(true);
        let media =
            acquire_local_media(Some(&devices), CallKind::Video, &CallConfig::default()).await;
        assert!(matches!(
            media,
            LocalMedia::Unavailable(CaptureError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn missing_platform_support_degrades() {
        let media = acquire_local_media(None, CallKind::Voice, &CallConfig::default()).await;
        assert!(matches!(media, LocalMedia::Unavailable(CaptureError::Unsupported)));
    }

    #[test]
    fn video_constraints_follow_config() {
        let config = CallConfig {
            video_width: 640,
            video_height: 480,
            ..CallConfig::default()
        };
        let c = MediaConstraints::for_call(CallKind::Video, &config);
        assert!(c.audio);
        assert_eq!(
            c.video,
            Some(VideoConstraints {
                width: 640,
                height: 480
            })
        );
        assert_eq!(MediaConstraints::for_call(CallKind::Voice, &config).video, None);
    }

    #[test]
    fn remote_stream_accumulates_in_any_order() {
        let remote = RemoteStream::default();
        let track = |id: &str, kind| RemoteTrack {
            id: id.into(),
            stream_id: "s".into(),
            kind,
            source: None,
        };
        assert!(remote.add_track(track("v", TrackKind::Video)));
        assert!(remote.add_track(track("a", TrackKind::Audio)));
        assert!(!remote.add_track(track("a", TrackKind::Audio)));
        assert_eq!(remote.tracks().len(), 2);
        assert!(remote.has_kind(TrackKind::Audio));
    }
}
