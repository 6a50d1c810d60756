//! Хранилище документов как канал сигналинга.
//!
//! Комната лежит по пути `rooms/{id}`, кандидаты сторон в подколлекциях
//! `rooms/{id}/callerCandidates` и `rooms/{id}/calleeCandidates`.
//! Пути с нечётным числом сегментов указывают на коллекцию, с чётным на документ.

pub mod memory;

use crate::config::CallConfig;
use crate::error::StoreError;
use crate::peer::types::Role;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Одно изменение документа в уведомлении подписки
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub kind: ChangeKind,
    pub id: String,
    pub data: Value,
}

/// Пакет изменений, доставленный подписчику за один раз
pub type Snapshot = Vec<DocChange>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Создаёт документ в коллекции, возвращает сгенерированный id
    async fn create_record(&self, collection: &str, data: Value) -> Result<String, StoreError>;

    /// Сливает поля в документ, не трогая остальные; создаёт документ, если его нет
    async fn merge_write(&self, doc: &str, partial: Value) -> Result<(), StoreError>;

    async fn read_once(&self, doc: &str) -> Result<Option<Value>, StoreError>;

    /// Подписка на документ или коллекцию. Первым приходит текущее состояние.
    async fn subscribe(&self, target: &str) -> Result<Subscription, StoreError>;
}

/// Отписка. Срабатывает один раз: явно или при drop.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn cancel(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct Subscription {
    pub changes: mpsc::UnboundedReceiver<Snapshot>,
    pub unsubscribe: Unsubscribe,
}

/// Подписка с обработчиком: уведомления обрабатываются по одному, в порядке доставки
pub struct Watch {
    task: Option<JoinHandle<()>>,
    unsubscribe: Unsubscribe,
}

impl Watch {
    pub fn spawn<F, Fut>(subscription: Subscription, mut handler: F) -> Self
    where
        F: FnMut(Snapshot) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Subscription {
            mut changes,
            unsubscribe,
        } = subscription;
        let task = tokio::spawn(async move {
            while let Some(snapshot) = changes.recv().await {
                handler(snapshot).await;
            }
        });
        Self {
            task: Some(task),
            unsubscribe,
        }
    }

    /// Для подписок, которые читают свой канал сами
    pub(crate) fn from_task(task: JoinHandle<()>, unsubscribe: Unsubscribe) -> Self {
        Self {
            task: Some(task),
            unsubscribe,
        }
    }

    pub fn cancel(&mut self) {
        self.unsubscribe.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub fn doc_path(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

fn segments(path: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}

pub fn is_collection_path(path: &str) -> bool {
    segments(path).is_some_and(|s| s.len() % 2 == 1)
}

pub fn is_document_path(path: &str) -> bool {
    segments(path).is_some_and(|s| s.len() % 2 == 0)
}

/// `rooms/abc` → (`rooms`, `abc`)
pub fn split_doc_path(path: &str) -> Option<(&str, &str)> {
    if !is_document_path(path) {
        return None;
    }
    path.rsplit_once('/')
}

/// Пути документа комнаты и её коллекций кандидатов
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRefs {
    pub room_id: String,
    pub room: String,
    pub caller_candidates: String,
    pub callee_candidates: String,
}

impl RoomRefs {
    pub fn new(config: &CallConfig, room_id: &str) -> Self {
        let room = doc_path(&config.rooms_collection, room_id);
        Self {
            room_id: room_id.to_string(),
            caller_candidates: format!("{room}/{}", config.caller_candidates),
            callee_candidates: format!("{room}/{}", config.callee_candidates),
            room,
        }
    }

    /// Куда пишет свои кандидаты сторона `role`
    pub fn own_candidates(&self, role: Role) -> &str {
        match role {
            Role::Initiator => &self.caller_candidates,
            Role::Responder => &self.callee_candidates,
        }
    }

    /// Откуда сторона `role` читает кандидаты собеседника
    pub fn remote_candidates(&self, role: Role) -> &str {
        match role {
            Role::Initiator => &self.callee_candidates,
            Role::Responder => &self.caller_candidates,
        }
    }
}
