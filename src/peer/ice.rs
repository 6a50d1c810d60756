use crate::error::Result;
use crate::logger::{dump_candidate, log, warn};
use crate::peer::connection::PeerConnection;
use crate::peer::types::{CandidateRecord, ServerConfig, SessionDescription};
use crate::signaling::{ChangeKind, Snapshot};
use crate::utils::add_ice_url_scheme;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Что стало с кандидатом собеседника
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Запись с этим id уже обработана
    Duplicate,
    /// Remote description ещё не установлен, кандидат отложен
    Queued,
    Applied,
    /// Соединение отвергло кандидат; повторно не применяется
    Rejected,
}

#[derive(Default)]
struct InboxState {
    seen: HashSet<String>,
    /// Кандидаты, полученные до установки remote description
    pending: Vec<CandidateRecord>,
    applied: usize,
}

/// Входящие кандидаты одной сессии.
///
/// Каждая запись применяется не больше одного раза, даже если подписка
/// доставила её повторно. Установка remote description и приём кандидатов
/// идут под одной блокировкой, поэтому кандидат не теряется между ними.
#[derive(Default)]
pub struct CandidateInbox {
    state: Mutex<InboxState>,
}

impl CandidateInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn receive(
        &self,
        pc: &dyn PeerConnection,
        record_id: &str,
        candidate: CandidateRecord,
    ) -> Received {
        let mut state = self.state.lock().await;
        if !state.seen.insert(record_id.to_string()) {
            return Received::Duplicate;
        }
        dump_candidate("REMOTE", &candidate);

        if pc.remote_description().await.is_none() {
            log("Remote description not set yet, queuing candidate");
            state.pending.push(candidate);
            return Received::Queued;
        }

        match pc.add_ice_candidate(candidate).await {
            Ok(()) => {
                state.applied += 1;
                Received::Applied
            }
            Err(e) => {
                warn(&format!("Failed to add ICE candidate: {e}"));
                Received::Rejected
            }
        }
    }

    /// Ставит remote description, если его ещё нет, и применяет отложенные кандидаты.
    /// Возвращает false, если описание уже было установлено.
    pub async fn apply_remote_description(
        &self,
        pc: &dyn PeerConnection,
        desc: SessionDescription,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if pc.remote_description().await.is_some() {
            return Ok(false);
        }
        pc.set_remote_description(desc).await?;

        let pending: Vec<CandidateRecord> = state.pending.drain(..).collect();
        for candidate in pending {
            log(&format!("Applying pending candidate: {}", candidate.candidate));
            match pc.add_ice_candidate(candidate).await {
                Ok(()) => state.applied += 1,
                Err(e) => warn(&format!("Failed to apply pending candidate: {e}")),
            }
        }
        Ok(true)
    }

    /// Обрабатывает пакет уведомлений коллекции кандидатов: только `Added`
    pub async fn handle_snapshot(&self, pc: &dyn PeerConnection, snapshot: Snapshot) {
        for change in snapshot {
            if change.kind != ChangeKind::Added {
                continue;
            }
            match serde_json::from_value::<CandidateRecord>(change.data) {
                Ok(candidate) => {
                    self.receive(pc, &change.id, candidate).await;
                }
                Err(e) => warn(&format!("Malformed candidate record {}: {e}", change.id)),
            }
        }
    }

    pub async fn applied_count(&self) -> usize {
        self.state.lock().await.applied
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

/// Проверяет, отвечает ли ICE сервер: ждём srflx (STUN) или relay (TURN) кандидата
pub async fn check_ice_server_availability(config: &ServerConfig, wait: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    log(&format!("Checking ICE server '{}' -> '{}'", config.url, url));

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => check_via_ice_gathering(Arc::new(pc), &config.r#type, wait).await,
        Err(e) => {
            warn(&format!("Failed to create peer connection: {e}"));
            false
        }
    }
}

async fn check_via_ice_gathering(
    peer_connection: Arc<RTCPeerConnection>,
    server_type: &str,
    wait: Duration,
) -> bool {
    let (state_tx, mut state_rx) = mpsc::channel(10);
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = state_tx.clone();
        log(&format!("ICE gathering state changed to: {:?}", state));
        tokio::spawn(async move {
            let _ = tx.send(state).await;
        });
        Box::pin(async {})
    }));

    let (candidate_tx, mut candidate_rx) = mpsc::channel(10);
    // Для STUN ищем srflx, для TURN relay
    let wanted = if server_type == "turn" { "relay" } else { "srflx" };

    peer_connection.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(json) if json.candidate.contains(wanted) => {
                    log(&format!("Found {wanted} candidate: {}", json.candidate));
                    let _ = tx.send(()).await;
                }
                Ok(json) => log(&format!("Skipping candidate: {}", json.candidate)),
                Err(e) => warn(&format!("Failed to get candidate JSON: {e}")),
            }
        })
    }));

    // Data channel нужен, чтобы offer запустил сбор кандидатов
    if let Err(e) = peer_connection.create_data_channel("probe", None).await {
        warn(&format!("Failed to create data channel: {e}"));
        let _ = peer_connection.close().await;
        return false;
    }
    let started = match peer_connection.create_offer(None).await {
        Ok(offer) => peer_connection.set_local_description(offer).await.is_ok(),
        Err(_) => false,
    };
    if !started {
        warn("Failed to start ICE gathering");
        let _ = peer_connection.close().await;
        return false;
    }

    let found = tokio::select! {
        result = timeout(wait, candidate_rx.recv()) => matches!(result, Ok(Some(()))),
        _ = async {
            while let Some(state) = state_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => {
            log("ICE gathering completed without a matching candidate");
            false
        }
    };
    let _ = peer_connection.close().await;
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakePeer;
    use serde_json::json;

    fn candidate(n: u32) -> CandidateRecord {
        CandidateRecord {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_flushed_after_it() {
        let pc = FakePeer::new();
        let inbox = CandidateInbox::new();

        assert_eq!(inbox.receive(&pc, "a", candidate(1)).await, Received::Queued);
        assert_eq!(inbox.receive(&pc, "b", candidate(2)).await, Received::Queued);
        assert!(pc.applied_candidates().is_empty());

        let applied = inbox
            .apply_remote_description(&pc, SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(pc.applied_candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(inbox.pending_count().await, 0);
    }

    #[tokio::test]
    async fn second_remote_description_is_ignored() {
        let pc = FakePeer::new();
        let inbox = CandidateInbox::new();
        let first = SessionDescription::answer("first");
        assert!(inbox.apply_remote_description(&pc, first.clone()).await.unwrap());
        assert!(!inbox
            .apply_remote_description(&pc, SessionDescription::answer("second"))
            .await
            .unwrap());
        assert_eq!(pc.remote_description_now(), Some(first));
    }

    #[tokio::test]
    async fn replayed_records_apply_once() {
        let pc = FakePeer::new();
        let inbox = CandidateInbox::new();
        inbox
            .apply_remote_description(&pc, SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let change = |id: &str, n| crate::signaling::DocChange {
            kind: ChangeKind::Added,
            id: id.into(),
            data: serde_json::to_value(candidate(n)).unwrap(),
        };
        inbox
            .handle_snapshot(&pc, vec![change("x", 1), change("y", 2)])
            .await;
        inbox
            .handle_snapshot(&pc, vec![change("y", 2), change("x", 1)])
            .await;

        assert_eq!(pc.applied_candidates().len(), 2);
        assert_eq!(inbox.applied_count().await, 2);
    }

    #[tokio::test]
    async fn modified_and_malformed_records_are_skipped() {
        let pc = FakePeer::new();
        let inbox = CandidateInbox::new();
        inbox
            .apply_remote_description(&pc, SessionDescription::offer("v=0"))
            .await
            .unwrap();

        inbox
            .handle_snapshot(
                &pc,
                vec![
                    crate::signaling::DocChange {
                        kind: ChangeKind::Modified,
                        id: "m".into(),
                        data: serde_json::to_value(candidate(1)).unwrap(),
                    },
                    crate::signaling::DocChange {
                        kind: ChangeKind::Added,
                        id: "bad".into(),
                        data: json!({"nope": true}),
                    },
                ],
            )
            .await;
        assert!(pc.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn rejected_candidate_is_not_retried() {
        let pc = FakePeer::new();
        pc.reject_candidates(true);
        let inbox = CandidateInbox::new();
        inbox
            .apply_remote_description(&pc, SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(inbox.receive(&pc, "a", candidate(1)).await, Received::Rejected);
        pc.reject_candidates(false);
        assert_eq!(inbox.receive(&pc, "a", candidate(1)).await, Received::Duplicate);
    }
}
