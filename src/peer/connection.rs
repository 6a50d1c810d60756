use crate::config::CallConfig;
use crate::error::Result;
use crate::logger::{dump_candidate, dump_selected_pair, log, warn};
use crate::peer::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::types::{CandidateRecord, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::track::track_local::TrackLocal;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Состояние транспорта, как его сообщает платформа
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(st: RTCPeerConnectionState) -> Self {
        match st {
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

pub type CandidateHandler = Box<dyn Fn(CandidateRecord) + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;
pub type StateHandler = Box<dyn Fn(PeerState) + Send + Sync>;

/// Примитив peer-соединения, которым пользуется согласование
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: CandidateRecord) -> Result<()>;

    /// Вызывается на каждый найденный локальный кандидат
    fn on_ice_candidate(&self, handler: CandidateHandler);
    fn on_track(&self, handler: TrackHandler);
    fn on_connection_state_change(&self, handler: StateHandler);

    /// Останавливает треки всех исходящих sender'ов
    async fn stop_senders(&self);
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn new_peer(&self, config: &CallConfig) -> Result<Arc<dyn PeerConnection>>;
}

/// Создаёт конфигурацию для peer connection
pub fn rtc_config(config: &CallConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(&config.ice_servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Перевод настроек серверов в формат webrtc
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Соединение на webrtc-rs
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self.pc.add_track(rtc_track).await?;

        // RTCP нужно вычитывать, иначе interceptor'ы не работают
        let track_id = track.id().to_string();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
            log(&format!("RTCP reader for {track_id} stopped"));
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.remote_description().await?;
        SessionDescription::from_rtc(&desc).ok()
    }

    async fn add_ice_candidate(&self, candidate: CandidateRecord) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let record = CandidateRecord::from(init);
                            dump_candidate("LOCAL", &record);
                            handler(record);
                        }
                        Err(e) => warn(&format!("Failed to serialize local candidate: {e}")),
                    },
                    // cand == None означает конец сбора
                    None => log("ICE candidate gathering completed (null candidate received)"),
                }
                Box::pin(async {})
            }));
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            match TrackKind::from_codec(track.kind()) {
                Some(kind) => handler(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    source: Some(track),
                }),
                None => warn("Remote track of unspecified kind ignored"),
            }
            Box::pin(async {})
        }));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        let pc_state = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                log(&format!("Peer connection state changed to: {:?}", st));
                if st == RTCPeerConnectionState::Failed {
                    if let Some(pc) = pc_state.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                handler(st.into());
                Box::pin(async {})
            }));
    }

    async fn stop_senders(&self) {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                warn(&format!("Failed to stop sender: {e}"));
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Фабрика соединений на webrtc-rs с кодеками и interceptor'ами по умолчанию
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn new_peer(&self, config: &CallConfig) -> Result<Arc<dyn PeerConnection>> {
        let pc = new_rtc_peer(config).await?;
        Ok(Arc::new(RtcPeer::new(pc)))
    }
}

/// создаём Peer с кодеками для звука и видео
pub async fn new_rtc_peer(config: &CallConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api.new_peer_connection(rtc_config(config)).await?;
    log(&format!(
        "Peer connection created with {} ICE server(s)",
        config.ice_servers.len()
    ));
    Ok(Arc::new(pc))
}
