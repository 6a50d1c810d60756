use crate::error::{CallError, Result};
use crate::logger::{log, warn};
use crate::peer::negotiation::{create_room, join_room, CallContext};
use crate::peer::state::NegotiationState;
use crate::peer::types::CallKind;
use crate::session::Session;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;

/// Что показывать в интерфейсе звонка
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub active: bool,
    #[serde(rename = "type")]
    pub kind: Option<CallKind>,
    pub conv_id: Option<String>,
    pub mic: bool,
    pub cam: bool,
    pub room_id: Option<String>,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            active: false,
            kind: None,
            conv_id: None,
            mic: true,
            cam: true,
            room_id: None,
        }
    }
}

impl CallState {
    fn started(session: &Session, conv_id: Option<String>) -> Self {
        Self {
            active: true,
            kind: Some(session.kind()),
            conv_id,
            mic: session.mic_enabled(),
            cam: session.cam_enabled(),
            room_id: Some(session.room_id().to_string()),
        }
    }
}

/// Один активный звонок на приложение
pub struct CallController {
    ctx: CallContext,
    // держим через await, пока идёт установка, чтобы второй звонок не стартовал параллельно
    session: AsyncMutex<Option<Session>>,
    state: Mutex<CallState>,
}

impl CallController {
    pub fn new(ctx: CallContext) -> Self {
        Self {
            ctx,
            session: AsyncMutex::new(None),
            state: Mutex::new(CallState::default()),
        }
    }

    fn state_lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn call_state(&self) -> CallState {
        self.state_lock().clone()
    }

    /// Создаёт комнату; id комнаты нужно передать собеседнику
    pub async fn start_call(&self, kind: CallKind, conv_id: Option<String>) -> Result<CallState> {
        let mut current = self.session.lock().await;
        if current.is_some() {
            return Err(CallError::CallInProgress);
        }
        let session = create_room(&self.ctx, kind).await?;
        let state = CallState::started(&session, conv_id);
        log(&format!("Call started in room {}", session.room_id()));
        *current = Some(session);
        *self.state_lock() = state.clone();
        Ok(state)
    }

    pub async fn join_call(
        &self,
        room_id: &str,
        kind: CallKind,
        conv_id: Option<String>,
    ) -> Result<CallState> {
        let mut current = self.session.lock().await;
        if current.is_some() {
            return Err(CallError::CallInProgress);
        }
        let session = join_room(&self.ctx, room_id, kind).await?;
        let state = CallState::started(&session, conv_id);
        log(&format!("Joined call in room {room_id}"));
        *current = Some(session);
        *self.state_lock() = state.clone();
        Ok(state)
    }

    /// Завершает звонок, если он есть. Ошибки завершения только логируются.
    pub async fn end_call(&self) {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                session.hangup().await;
                log(&format!("Call in room {} ended", session.room_id()));
            }
            None => warn("end_call without an active call"),
        }
        *self.state_lock() = CallState::default();
    }

    pub async fn toggle_mic(&self) -> Result<bool> {
        let current = self.session.lock().await;
        let session = current.as_ref().ok_or(CallError::NoActiveCall)?;
        let mic = session.toggle_mic();
        self.state_lock().mic = mic;
        Ok(mic)
    }

    /// В голосовом звонке камеры нет: состояние не меняется
    pub async fn toggle_cam(&self) -> Result<bool> {
        let current = self.session.lock().await;
        let session = current.as_ref().ok_or(CallError::NoActiveCall)?;
        if session.kind() != CallKind::Video {
            return Ok(session.cam_enabled());
        }
        let cam = session.toggle_cam();
        self.state_lock().cam = cam;
        Ok(cam)
    }

    pub async fn negotiation_state(&self) -> Option<NegotiationState> {
        self.session.lock().await.as_ref().map(|s| s.state())
    }

    pub async fn is_connected(&self) -> bool {
        self.negotiation_state().await == Some(NegotiationState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::peer::connection::PeerState;
    use crate::peer::media::SyntheticDevices;
    use crate::signaling::MemoryStore;
    use crate::test_utils::{settle, FakePeerFactory};
    use std::sync::Arc;

    fn controller(store: &MemoryStore) -> (CallController, Arc<FakePeerFactory>) {
        let peers = Arc::new(FakePeerFactory::new());
        let ctx = CallContext::new(
            Arc::new(store.clone()),
            peers.clone(),
            Some(Arc::new(SyntheticDevices::new())),
            CallConfig::default(),
        );
        (CallController::new(ctx), peers)
    }

    #[tokio::test]
    async fn idle_state_has_mic_and_cam_on() {
        let (calls, _) = controller(&MemoryStore::new());
        let state = calls.call_state();
        assert!(!state.active);
        assert!(state.mic && state.cam);
        assert_eq!(state.room_id, None);
    }

    #[tokio::test]
    async fn voice_call_starts_with_camera_off() {
        let (calls, _) = controller(&MemoryStore::new());
        let state = calls
            .start_call(CallKind::Voice, Some("conv-1".into()))
            .await
            .unwrap();
        assert!(state.active);
        assert_eq!(state.kind, Some(CallKind::Voice));
        assert!(state.mic);
        assert!(!state.cam);
        assert_eq!(state.conv_id.as_deref(), Some("conv-1"));
        assert!(state.room_id.is_some());

        assert!(!calls.toggle_cam().await.unwrap());
        assert!(!calls.call_state().cam);
        calls.end_call().await;
    }

    #[tokio::test]
    async fn second_call_is_refused_while_active() {
        let (calls, peers) = controller(&MemoryStore::new());
        calls.start_call(CallKind::Video, None).await.unwrap();
        let err = calls.start_call(CallKind::Voice, None).await.unwrap_err();
        assert!(matches!(err, CallError::CallInProgress));
        let err = calls
            .join_call("anything", CallKind::Voice, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CallInProgress));
        assert_eq!(peers.all().len(), 1);
        calls.end_call().await;
    }

    #[tokio::test]
    async fn toggles_follow_session() {
        let (calls, _) = controller(&MemoryStore::new());
        assert!(matches!(
            calls.toggle_mic().await,
            Err(CallError::NoActiveCall)
        ));

        calls.start_call(CallKind::Video, None).await.unwrap();
        assert!(!calls.toggle_mic().await.unwrap());
        assert!(!calls.toggle_cam().await.unwrap());
        let state = calls.call_state();
        assert!(!state.mic && !state.cam);
        assert!(calls.toggle_mic().await.unwrap());
        calls.end_call().await;
    }

    #[tokio::test]
    async fn end_call_resets_state_and_closes_peer() {
        let store = MemoryStore::new();
        let (calls, peers) = controller(&store);
        calls.start_call(CallKind::Video, None).await.unwrap();
        let peer = peers.last().unwrap();

        calls.end_call().await;
        assert!(peer.is_closed());
        assert_eq!(calls.call_state(), CallState::default());
        assert_eq!(calls.negotiation_state().await, None);

        // повторное завершение безопасно
        calls.end_call().await;
        calls.start_call(CallKind::Voice, None).await.unwrap();
        calls.end_call().await;
    }

    #[tokio::test]
    async fn both_sides_reach_connected() {
        let store = MemoryStore::new();
        let (caller, caller_peers) = controller(&store);
        let (callee, callee_peers) = controller(&store);

        let started = caller.start_call(CallKind::Voice, None).await.unwrap();
        let room = started.room_id.unwrap();
        let joined = callee.join_call(&room, CallKind::Voice, None).await.unwrap();
        assert_eq!(joined.room_id.as_deref(), Some(room.as_str()));
        settle().await;

        caller_peers.last().unwrap().emit_state(PeerState::Connected);
        callee_peers.last().unwrap().emit_state(PeerState::Connected);
        assert!(caller.is_connected().await);
        assert!(callee.is_connected().await);

        callee.end_call().await;
        caller.end_call().await;
    }

    #[tokio::test]
    async fn failed_join_leaves_controller_idle() {
        let (calls, peers) = controller(&MemoryStore::new());
        let err = calls
            .join_call("missing", CallKind::Voice, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RoomNotFound(_)));
        assert!(!calls.call_state().active);
        assert!(peers.all().iter().all(|p| p.is_closed()));
    }
}
