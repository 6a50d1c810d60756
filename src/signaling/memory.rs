//! Хранилище документов в памяти процесса.
//!
//! Семантика та же, что у облачного хранилища: merge-запись, подписки с
//! начальным снимком и типами изменений. Клон `MemoryStore` указывает на те
//! же данные, поэтому две стороны звонка в одном процессе видят одну комнату.

use super::{
    is_collection_path, split_doc_path, ChangeKind, DocChange, DocumentStore, Snapshot,
    Subscription, Unsubscribe,
};
use crate::error::StoreError;
use crate::logger::log;
use crate::utils::random_id;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Subscriber {
    id: u64,
    target: String,
    tx: mpsc::UnboundedSender<Snapshot>,
}

struct Inner {
    /// путь коллекции → документы в порядке создания
    collections: HashMap<String, Vec<(String, Value)>>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    available: bool,
    /// сегменты путей, запись под которыми отклоняется
    denied: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                collections: HashMap::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                available: true,
                denied: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // данные остаются согласованными даже после паники в другом потоке
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Имитирует недоступность хранилища: все операции завершаются ошибкой
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Отклонять записи в пути, содержащие сегмент `segment`
    pub fn deny_writes_under(&self, segment: &str) {
        self.lock().denied.push(segment.to_string());
    }

    /// Повторно доставляет текущее состояние цели как `Added`.
    /// Так ведёт себя подписка облачного хранилища после переподключения.
    pub fn replay(&self, target: &str) {
        let mut inner = self.lock();
        let snapshot = inner.snapshot_of(target);
        if !snapshot.is_empty() {
            inner.notify(target, snapshot);
        }
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, |docs| docs.len())
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    fn check_writable(&self, path: &str) -> Result<(), StoreError> {
        self.check_available()?;
        if path
            .split('/')
            .any(|seg| self.denied.iter().any(|d| d == seg))
        {
            return Err(StoreError::Rejected(path.to_string()));
        }
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> Option<&Value> {
        self.collections
            .get(collection)?
            .iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, data)| data)
    }

    /// Текущее состояние цели подписки как набор `Added`
    fn snapshot_of(&self, target: &str) -> Snapshot {
        if is_collection_path(target) {
            return self
                .collections
                .get(target)
                .map(|docs| {
                    docs.iter()
                        .map(|(id, data)| DocChange {
                            kind: ChangeKind::Added,
                            id: id.clone(),
                            data: data.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
        }
        match split_doc_path(target) {
            Some((collection, id)) => self
                .get(collection, id)
                .map(|data| {
                    vec![DocChange {
                        kind: ChangeKind::Added,
                        id: id.to_string(),
                        data: data.clone(),
                    }]
                })
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn notify(&mut self, target: &str, snapshot: Snapshot) {
        self.subscribers.retain(|sub| {
            if sub.target != target {
                return true;
            }
            // закрытый получатель означает, что подписчик уже ушёл
            sub.tx.send(snapshot.clone()).is_ok()
        });
    }

    /// Рассылает изменение документа подписчикам коллекции и самого документа
    fn publish(&mut self, collection: &str, change: DocChange) {
        let doc = format!("{collection}/{}", change.id);
        self.notify(collection, vec![change.clone()]);
        self.notify(&doc, vec![change]);
    }
}

/// Глубокое слияние объектов, как `set(..., { merge: true })`
fn merge_into(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(patch)) => {
            for (key, value) in patch {
                match existing.get_mut(&key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        merge_into(slot, value)
                    }
                    _ => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_record(&self, collection: &str, data: Value) -> Result<String, StoreError> {
        if !is_collection_path(collection) {
            return Err(StoreError::InvalidPath(collection.to_string()));
        }
        let mut inner = self.lock();
        inner.check_writable(collection)?;

        let id = random_id();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), data.clone()));
        inner.publish(
            collection,
            DocChange {
                kind: ChangeKind::Added,
                id: id.clone(),
                data,
            },
        );
        Ok(id)
    }

    async fn merge_write(&self, doc: &str, partial: Value) -> Result<(), StoreError> {
        let (collection, id) =
            split_doc_path(doc).ok_or_else(|| StoreError::InvalidPath(doc.to_string()))?;
        let mut inner = self.lock();
        inner.check_writable(doc)?;

        let docs = inner.collections.entry(collection.to_string()).or_default();
        let change = match docs.iter_mut().find(|(doc_id, _)| doc_id == id) {
            Some((_, data)) => {
                merge_into(data, partial);
                DocChange {
                    kind: ChangeKind::Modified,
                    id: id.to_string(),
                    data: data.clone(),
                }
            }
            None => {
                let mut data = Value::Object(Default::default());
                merge_into(&mut data, partial);
                docs.push((id.to_string(), data.clone()));
                DocChange {
                    kind: ChangeKind::Added,
                    id: id.to_string(),
                    data,
                }
            }
        };
        inner.publish(collection, change);
        Ok(())
    }

    async fn read_once(&self, doc: &str) -> Result<Option<Value>, StoreError> {
        let (collection, id) =
            split_doc_path(doc).ok_or_else(|| StoreError::InvalidPath(doc.to_string()))?;
        let inner = self.lock();
        inner.check_available()?;
        Ok(inner.get(collection, id).cloned())
    }

    async fn subscribe(&self, target: &str) -> Result<Subscription, StoreError> {
        if !is_collection_path(target) && split_doc_path(target).is_none() {
            return Err(StoreError::InvalidPath(target.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            inner.check_available()?;

            let initial = inner.snapshot_of(target);
            if !initial.is_empty() {
                let _ = tx.send(initial);
            }
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push(Subscriber {
                id,
                target: target.to_string(),
                tx,
            });
            id
        };
        log(&format!("Subscribed #{id} to {target}"));

        let store = self.clone();
        Ok(Subscription {
            changes: rx,
            unsubscribe: Unsubscribe::new(move || {
                store.lock().subscribers.retain(|sub| sub.id != id);
            }),
        })
    }
}
