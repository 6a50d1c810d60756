//! Согласование звонка через документ комнаты.
//!
//! Инициатор создаёт комнату и пишет offer, ответчик читает offer и пишет
//! answer. Кандидаты каждая сторона складывает в свою подколлекцию и
//! слушает подколлекцию собеседника.

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::{log, warn};
use crate::peer::connection::{CandidateHandler, PeerConnection, PeerFactory, PeerState};
use crate::peer::ice::CandidateInbox;
use crate::peer::media::{
    acquire_local_media, LocalMedia, MediaDevices, RemoteStream, RemoteTrack,
};
use crate::peer::state::{NegotiationState, StateCell};
use crate::peer::types::{CallKind, CandidateRecord, Role, Room, SdpKind};
use crate::session::{Session, SessionParts, Teardown};
use crate::signaling::{ChangeKind, DocumentStore, RoomRefs, Watch};
use crate::utils::now_millis;
use serde_json::json;
use std::sync::Arc;

/// Явный контекст звонков: хранилище, платформа и настройки
#[derive(Clone)]
pub struct CallContext {
    pub store: Arc<dyn DocumentStore>,
    pub peers: Arc<dyn PeerFactory>,
    /// `None`, если платформа не умеет захватывать медиа
    pub devices: Option<Arc<dyn MediaDevices>>,
    pub config: CallConfig,
}

impl CallContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        peers: Arc<dyn PeerFactory>,
        devices: Option<Arc<dyn MediaDevices>>,
        config: CallConfig,
    ) -> Self {
        Self {
            store,
            peers,
            devices,
            config,
        }
    }
}

/// Соединение и потоки до того, как стала известна комната
struct Setup {
    peer: Arc<dyn PeerConnection>,
    local: LocalMedia,
    remote: Arc<RemoteStream>,
    state: Arc<StateCell>,
    inbox: Arc<CandidateInbox>,
    teardown: Teardown,
}

impl Setup {
    async fn prepare(ctx: &CallContext, kind: CallKind) -> Result<Self> {
        let peer = ctx.peers.new_peer(&ctx.config).await?;
        let local = acquire_local_media(ctx.devices.as_deref(), kind, &ctx.config).await;
        let state = Arc::new(StateCell::default());
        let teardown = Teardown::new(peer.clone(), local.clone(), state.clone());

        if let Some(stream) = local.stream() {
            for track in stream.tracks() {
                if let Err(e) = peer.add_track(track.clone()).await {
                    teardown.run().await;
                    return Err(e);
                }
            }
        }

        let remote = Arc::new(RemoteStream::default());
        peer.on_track({
            let remote = remote.clone();
            Box::new(move |track: RemoteTrack| {
                // трек без потока не к чему присоединить
                if track.stream_id.is_empty() {
                    warn(&format!("Remote track {} has no stream, ignoring", track.id));
                    return;
                }
                remote.add_track(track);
            })
        });

        peer.on_connection_state_change({
            let state = state.clone();
            Box::new(move |st: PeerState| match st {
                PeerState::Connected => {
                    if state.advance(NegotiationState::Connected) {
                        log("Call connected");
                    }
                }
                PeerState::Disconnected | PeerState::Failed => {
                    warn(&format!("Peer connection {:?}", st));
                }
                _ => {}
            })
        });

        Ok(Self {
            peer,
            local,
            remote,
            state,
            inbox: Arc::new(CandidateInbox::new()),
            teardown,
        })
    }

    fn into_session(self, room_id: String, kind: CallKind, role: Role) -> Session {
        Session::from_parts(SessionParts {
            room_id,
            kind,
            role,
            peer: self.peer,
            local: self.local,
            remote: self.remote,
            state: self.state,
            inbox: self.inbox,
            teardown: self.teardown,
        })
    }

    /// Подписка на кандидаты собеседника: каждый новый `Added` идёт в соединение
    async fn watch_remote_candidates(&mut self, store: &dyn DocumentStore, path: &str) -> Result<()> {
        let subscription = store.subscribe(path).await?;
        let peer = self.peer.clone();
        let inbox = self.inbox.clone();
        self.teardown.candidate_watch = Some(Watch::spawn(subscription, move |snapshot| {
            let peer = peer.clone();
            let inbox = inbox.clone();
            async move { inbox.handle_snapshot(peer.as_ref(), snapshot).await }
        }));
        Ok(())
    }
}

/// Каждый найденный локальный кандидат пишется отдельной записью. Ошибка записи
/// логируется и не повторяется.
fn candidate_writer(store: Arc<dyn DocumentStore>, collection: String) -> CandidateHandler {
    Box::new(move |candidate: CandidateRecord| {
        let store = store.clone();
        let collection = collection.clone();
        tokio::spawn(async move {
            let data = match serde_json::to_value(&candidate) {
                Ok(data) => data,
                Err(e) => {
                    warn(&format!("Failed to serialize local candidate: {e}"));
                    return;
                }
            };
            if let Err(e) = store.create_record(&collection, data).await {
                warn(&format!("Dropping local candidate, write to {collection} failed: {e}"));
            }
        });
    })
}

/// Инициатор: создаёт комнату, публикует offer и ждёт answer
pub async fn create_room(ctx: &CallContext, kind: CallKind) -> Result<Session> {
    log(&format!("create_room called, kind={}", kind.as_str()));
    let mut setup = Setup::prepare(ctx, kind).await?;
    match initiate(ctx, kind, &mut setup).await {
        Ok(room_id) => {
            log(&format!("Room {room_id} created, waiting for answer"));
            Ok(setup.into_session(room_id, kind, Role::Initiator))
        }
        Err(e) => {
            warn(&format!("create_room failed: {e}"));
            setup.teardown.run().await;
            Err(e)
        }
    }
}

async fn initiate(ctx: &CallContext, kind: CallKind, setup: &mut Setup) -> Result<String> {
    let store = ctx.store.clone();
    let room_id = store
        .create_record(
            &ctx.config.rooms_collection,
            json!({ "kind": kind, "created": now_millis() }),
        )
        .await?;
    let refs = RoomRefs::new(&ctx.config, &room_id);
    setup.teardown.owned_room = Some((store.clone(), refs.room.clone()));

    setup.peer.on_ice_candidate(candidate_writer(
        store.clone(),
        refs.own_candidates(Role::Initiator).to_string(),
    ));

    log("Creating offer...");
    let offer = setup.peer.create_offer().await?;
    setup.peer.set_local_description(offer.clone()).await?;
    setup.state.advance(NegotiationState::LocalDescriptionSet);

    // только offer: kind и created уже в документе
    store.merge_write(&refs.room, json!({ "offer": offer })).await?;
    setup.state.advance(NegotiationState::RemoteDescriptionPending);

    let subscription = store.subscribe(&refs.room).await?;
    let peer = setup.peer.clone();
    let inbox = setup.inbox.clone();
    let watched_room = room_id.clone();
    setup.teardown.room_watch = Some(Watch::spawn(subscription, move |snapshot| {
        let peer = peer.clone();
        let inbox = inbox.clone();
        let room_id = watched_room.clone();
        async move {
            for change in snapshot {
                if change.kind == ChangeKind::Removed {
                    continue;
                }
                let room: Room = match serde_json::from_value(change.data) {
                    Ok(room) => room,
                    Err(e) => {
                        warn(&format!("Unreadable room {room_id} update: {e}"));
                        continue;
                    }
                };
                let Some(answer) = room.answer else {
                    continue;
                };
                if answer.kind != SdpKind::Answer {
                    warn(&format!("Room {room_id} answer field holds an offer, ignoring"));
                    continue;
                }
                match inbox.apply_remote_description(peer.as_ref(), answer).await {
                    Ok(true) => log(&format!("Answer applied for room {room_id}")),
                    Ok(false) => {}
                    Err(e) => warn(&format!("Failed to apply answer for room {room_id}: {e}")),
                }
            }
        }
    }));

    setup
        .watch_remote_candidates(store.as_ref(), refs.remote_candidates(Role::Initiator))
        .await?;
    Ok(room_id)
}

/// Ответчик: читает offer из комнаты и публикует answer
pub async fn join_room(ctx: &CallContext, room_id: &str, kind: CallKind) -> Result<Session> {
    log(&format!("join_room called, room={room_id} kind={}", kind.as_str()));
    if room_id.is_empty() || room_id.contains('/') {
        return Err(CallError::RoomNotFound(room_id.to_string()));
    }

    let mut setup = Setup::prepare(ctx, kind).await?;
    match respond(ctx, room_id, kind, &mut setup).await {
        Ok(()) => {
            log(&format!("Answer published to room {room_id}"));
            Ok(setup.into_session(room_id.to_string(), kind, Role::Responder))
        }
        Err(e) => {
            warn(&format!("join_room failed: {e}"));
            setup.teardown.run().await;
            Err(e)
        }
    }
}

async fn respond(ctx: &CallContext, room_id: &str, kind: CallKind, setup: &mut Setup) -> Result<()> {
    let store = ctx.store.clone();
    let refs = RoomRefs::new(&ctx.config, room_id);

    let data = store
        .read_once(&refs.room)
        .await?
        .ok_or_else(|| CallError::RoomNotFound(room_id.to_string()))?;
    let room: Room = serde_json::from_value(data).map_err(|e| CallError::MalformedRoom {
        room_id: room_id.to_string(),
        reason: e.to_string(),
    })?;
    if room.ended.is_some() {
        return Err(CallError::RoomNotFound(room_id.to_string()));
    }
    if room.kind != kind {
        log(&format!(
            "Room {room_id} was created for {} but joining as {}",
            room.kind.as_str(),
            kind.as_str()
        ));
    }
    let offer = room
        .offer
        .filter(|offer| offer.kind == SdpKind::Offer)
        .ok_or_else(|| CallError::MalformedRoom {
            room_id: room_id.to_string(),
            reason: "room has no offer".into(),
        })?;

    setup
        .inbox
        .apply_remote_description(setup.peer.as_ref(), offer)
        .await?;

    setup.peer.on_ice_candidate(candidate_writer(
        store.clone(),
        refs.own_candidates(Role::Responder).to_string(),
    ));

    log("Creating answer...");
    let answer = setup.peer.create_answer().await?;
    setup.peer.set_local_description(answer.clone()).await?;
    setup.state.advance(NegotiationState::LocalDescriptionSet);

    // только answer: offer, kind и created не трогаем
    store.merge_write(&refs.room, json!({ "answer": answer })).await?;
    setup.state.advance(NegotiationState::RemoteDescriptionPending);

    setup
        .watch_remote_candidates(store.as_ref(), refs.remote_candidates(Role::Responder))
        .await
}
