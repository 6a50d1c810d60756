use crate::logger::{log, warn};
use crate::peer::connection::PeerConnection;
use crate::peer::ice::CandidateInbox;
use crate::peer::media::{LocalMedia, RemoteStream};
use crate::peer::state::{NegotiationState, StateCell};
use crate::peer::types::{CallKind, Role};
use crate::signaling::{DocumentStore, Watch};
use crate::utils::now_millis;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Всё, что нужно освободить при завершении звонка.
///
/// Собирается по мере установки; при ошибке установки выполняется сразу,
/// поэтому каждое поле может быть ещё пустым.
pub(crate) struct Teardown {
    peer: Arc<dyn PeerConnection>,
    local: LocalMedia,
    state: Arc<StateCell>,
    pub(crate) room_watch: Option<Watch>,
    pub(crate) candidate_watch: Option<Watch>,
    /// Документ комнаты, который инициатор помечает `ended`
    pub(crate) owned_room: Option<(Arc<dyn DocumentStore>, String)>,
}

impl Teardown {
    pub(crate) fn new(peer: Arc<dyn PeerConnection>, local: LocalMedia, state: Arc<StateCell>) -> Self {
        Self {
            peer,
            local,
            state,
            room_watch: None,
            candidate_watch: None,
            owned_room: None,
        }
    }

    /// Каждый шаг изолирован: сбой одного не мешает остальным
    pub(crate) async fn run(mut self) {
        if let Some(mut watch) = self.room_watch.take() {
            watch.cancel();
        }
        if let Some(mut watch) = self.candidate_watch.take() {
            watch.cancel();
        }

        if let Some((store, room)) = self.owned_room.take() {
            if let Err(e) = store.merge_write(&room, json!({ "ended": now_millis() })).await {
                warn(&format!("Failed to mark {room} as ended: {e}"));
            }
        }

        if let Some(stream) = self.local.stream() {
            stream.stop_all();
        }
        self.peer.stop_senders().await;
        if let Err(e) = self.peer.close().await {
            warn(&format!("Failed to close peer connection: {e}"));
        }

        self.state.advance(NegotiationState::Closed);
        log("Session torn down");
    }
}

/// Звонок, возвращаемый вызывающему коду
pub struct Session {
    room_id: String,
    kind: CallKind,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    local: LocalMedia,
    remote: Arc<RemoteStream>,
    state: Arc<StateCell>,
    inbox: Arc<CandidateInbox>,
    mic: AtomicBool,
    cam: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("room_id", &self.room_id)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct SessionParts {
    pub room_id: String,
    pub kind: CallKind,
    pub role: Role,
    pub peer: Arc<dyn PeerConnection>,
    pub local: LocalMedia,
    pub remote: Arc<RemoteStream>,
    pub state: Arc<StateCell>,
    pub inbox: Arc<CandidateInbox>,
    pub teardown: Teardown,
}

impl Session {
    pub(crate) fn from_parts(parts: SessionParts) -> Self {
        Self {
            room_id: parts.room_id,
            kind: parts.kind,
            role: parts.role,
            peer: parts.peer,
            local: parts.local,
            remote: parts.remote,
            state: parts.state,
            inbox: parts.inbox,
            mic: AtomicBool::new(true),
            cam: AtomicBool::new(parts.kind == CallKind::Video),
            teardown: Mutex::new(Some(parts.teardown)),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn local(&self) -> &LocalMedia {
        &self.local
    }

    pub fn remote(&self) -> &Arc<RemoteStream> {
        &self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    pub fn mic_enabled(&self) -> bool {
        self.mic.load(Ordering::SeqCst)
    }

    pub fn cam_enabled(&self) -> bool {
        self.cam.load(Ordering::SeqCst)
    }

    /// Сколько кандидатов собеседника применено к соединению
    pub async fn remote_candidates_applied(&self) -> usize {
        self.inbox.applied_count().await
    }

    /// Включает/выключает микрофон, без пересогласования. Возвращает новое значение.
    pub fn toggle_mic(&self) -> bool {
        let next = !self.mic.fetch_xor(true, Ordering::SeqCst);
        if let Some(stream) = self.local.stream() {
            stream.audio_tracks().for_each(|t| t.set_enabled(next));
        }
        log(&format!("Microphone {}", if next { "on" } else { "off" }));
        next
    }

    pub fn toggle_cam(&self) -> bool {
        let next = !self.cam.fetch_xor(true, Ordering::SeqCst);
        if let Some(stream) = self.local.stream() {
            stream.video_tracks().for_each(|t| t.set_enabled(next));
        }
        log(&format!("Camera {}", if next { "on" } else { "off" }));
        next
    }

    /// Завершает звонок. Повторный вызов ничего не делает.
    pub async fn hangup(&self) {
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match teardown {
            Some(teardown) => {
                log(&format!("Hanging up {:?} session in room {}", self.role, self.room_id));
                teardown.run().await;
            }
            None => log("Hangup called on a finished session, ignoring"),
        }
    }
}
