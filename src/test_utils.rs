use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::peer::connection::{
    CandidateHandler, PeerConnection, PeerFactory, PeerState, StateHandler, TrackHandler,
};
use crate::peer::media::{LocalTrack, RemoteTrack};
use crate::peer::types::{CandidateRecord, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Даёт отработать задачам подписок и записи кандидатов
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[derive(Default)]
struct FakeState {
    tracks: Vec<Arc<LocalTrack>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    candidates: Vec<CandidateRecord>,
    reject_candidates: bool,
    senders_stopped: bool,
    closed: bool,
}

/// Соединение без сети: записывает вызовы и при установке локального
/// описания "находит" два host-кандидата.
#[derive(Default)]
pub struct FakePeer {
    label: usize,
    state: Mutex<FakeState>,
    on_candidate: Mutex<Option<Arc<CandidateHandler>>>,
    on_track: Mutex<Option<Arc<TrackHandler>>>,
    on_state: Mutex<Option<Arc<StateHandler>>>,
}

impl FakePeer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_label(label: usize) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.lock().tracks.clone()
    }

    pub fn track_count(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn applied_candidates(&self) -> Vec<CandidateRecord> {
        self.lock().candidates.clone()
    }

    pub fn remote_description_now(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    pub fn remote_description_sets(&self) -> usize {
        self.lock().remote_sets
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.lock().reject_candidates = reject;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn senders_stopped(&self) -> bool {
        self.lock().senders_stopped
    }

    pub fn emit_track(&self, track: RemoteTrack) {
        let handler = self.on_track.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(track);
        }
    }

    pub fn emit_state(&self, state: PeerState) {
        let handler = self.on_state.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn gather(&self) {
        let handler = self.on_candidate.lock().unwrap().clone();
        let Some(handler) = handler else {
            return;
        };
        for n in 1..=2 {
            handler(CandidateRecord {
                candidate: format!(
                    "candidate:{n} 1 udp 2130706431 10.0.{}.{n} 5000{n} typ host",
                    self.label
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            });
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(CallError::Peer("connection closed".into()));
        }
        state.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let tracks = self.lock().tracks.len();
        Ok(SessionDescription::offer(format!(
            "v=0 fake-offer peer={} tracks={tracks}",
            self.label
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.lock();
        match &state.remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(
                format!("v=0 fake-answer peer={}", self.label),
            )),
            _ => Err(CallError::Peer("no remote offer".into())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(CallError::Peer("connection closed".into()));
            }
            state.local = Some(desc);
        }
        self.gather();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(CallError::Peer("connection closed".into()));
        }
        state.remote = Some(desc);
        state.remote_sets += 1;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: CandidateRecord) -> Result<()> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(CallError::Peer("remote description not set".into()));
        }
        if state.reject_candidates {
            return Err(CallError::Peer("candidate rejected".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        *self.on_candidate.lock().unwrap() = Some(Arc::new(handler));
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.on_track.lock().unwrap() = Some(Arc::new(handler));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        *self.on_state.lock().unwrap() = Some(Arc::new(handler));
    }

    async fn stop_senders(&self) {
        self.lock().senders_stopped = true;
    }

    async fn close(&self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

/// Выдаёт FakePeer и запоминает их для проверок
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
    counter: AtomicUsize,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn new_peer(&self, _config: &CallConfig) -> Result<Arc<dyn PeerConnection>> {
        let label = self.counter.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(FakePeer::with_label(label));
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}
