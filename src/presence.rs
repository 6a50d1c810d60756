//! Присутствие и индикатор набора текста поверх realtime key-value хранилища.
//!
//! Текущий пользователь передаётся явно; без него запись ничего не делает.

use crate::error::StoreError;
use crate::logger::log;
use crate::signaling::{Unsubscribe, Watch};
use crate::utils::now_millis;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// uid → 1 (печатает) или 0 (перестал)
pub type TypingMap = BTreeMap<String, i64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub uid: String,
}

impl CurrentUser {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }
}

pub struct ValueSubscription {
    /// Значение по пути целиком: сначала текущее, затем после каждого изменения
    pub values: mpsc::UnboundedReceiver<Value>,
    pub unsubscribe: Unsubscribe,
}

/// Метка времени, которую хранилище подставляет само в момент применения записи.
/// Для отложенной записи это время отключения, а не время регистрации.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

fn resolve_server_values(value: &mut Value, now: i64) {
    if *value == server_timestamp() {
        *value = json!(now);
        return;
    }
    match value {
        Value::Object(map) => map
            .values_mut()
            .for_each(|v| resolve_server_values(v, now)),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|v| resolve_server_values(v, now)),
        _ => {}
    }
}

#[async_trait]
pub trait RealtimeDb: Send + Sync {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Запись, которую сервер выполнит сам, когда клиент отключится.
    /// [`server_timestamp`] внутри значения раскрывается при выполнении.
    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    async fn subscribe(&self, path: &str) -> Result<ValueSubscription, StoreError>;
}

fn status_path(user: &CurrentUser) -> String {
    format!("status/{}", user.uid)
}

fn typing_path(conv_id: &str) -> String {
    format!("typing/{conv_id}")
}

/// Регистрирует `offline` на отключение, затем пишет `online`
pub async fn wire_presence(
    db: &dyn RealtimeDb,
    user: Option<&CurrentUser>,
) -> Result<(), StoreError> {
    let Some(user) = user else {
        return Ok(());
    };
    let path = status_path(user);
    db.on_disconnect_set(
        &path,
        json!({ "state": "offline", "last_changed": server_timestamp() }),
    )
    .await?;
    db.set(&path, json!({ "state": "online", "last_changed": server_timestamp() }))
        .await?;
    log(&format!("Presence wired for {}", user.uid));
    Ok(())
}

pub async fn set_typing(
    db: &dyn RealtimeDb,
    conv_id: &str,
    user: Option<&CurrentUser>,
    typing: bool,
) -> Result<(), StoreError> {
    let Some(user) = user else {
        return Ok(());
    };
    let path = format!("{}/{}", typing_path(conv_id), user.uid);
    db.set(&path, json!(if typing { 1 } else { 0 })).await
}

fn typing_map(value: Value, exclude: Option<&str>) -> TypingMap {
    let Value::Object(entries) = value else {
        return TypingMap::new();
    };
    entries
        .into_iter()
        .filter(|(uid, _)| Some(uid.as_str()) != exclude)
        .filter_map(|(uid, v)| v.as_i64().map(|n| (uid, n)))
        .collect()
}

/// Отдаёт `on_change` карту печатающих в беседе, без текущего пользователя.
/// Подписка живёт, пока жив возвращённый `Watch`.
pub async fn subscribe_typing<F>(
    db: &dyn RealtimeDb,
    conv_id: &str,
    user: Option<&CurrentUser>,
    mut on_change: F,
) -> Result<Watch, StoreError>
where
    F: FnMut(TypingMap) + Send + 'static,
{
    let ValueSubscription {
        mut values,
        unsubscribe,
    } = db.subscribe(&typing_path(conv_id)).await?;
    let exclude = user.map(|u| u.uid.clone());

    let task = tokio::spawn(async move {
        while let Some(value) = values.recv().await {
            on_change(typing_map(value, exclude.as_deref()));
        }
    });
    Ok(Watch::from_task(task, unsubscribe))
}

struct DbSubscriber {
    id: u64,
    path: String,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct DbInner {
    root: Map<String, Value>,
    on_disconnect: Vec<(String, Value)>,
    subscribers: Vec<DbSubscriber>,
    next_subscriber: u64,
}

/// Realtime-хранилище в памяти процесса: дерево JSON по путям через `/`
#[derive(Clone, Default)]
pub struct MemoryRealtimeDb {
    inner: Arc<Mutex<DbInner>>,
}

fn path_segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

fn overlaps(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

impl DbInner {
    fn get(&self, path: &str) -> Value {
        let Ok(parts) = path_segments(path) else {
            return Value::Null;
        };
        let Some((first, rest)) = parts.split_first() else {
            return Value::Null;
        };
        let mut current = self.root.get(*first);
        for seg in rest {
            current = current.and_then(|v| v.get(*seg));
        }
        current.cloned().unwrap_or(Value::Null)
    }

    fn put(&mut self, path: &str, mut value: Value) -> Result<(), StoreError> {
        let parts = path_segments(path)?;
        resolve_server_values(&mut value, now_millis());
        let Some((last, parents)) = parts.split_last() else {
            return Err(StoreError::InvalidPath(path.to_string()));
        };
        let mut node = &mut self.root;
        for seg in parents {
            let entry = node
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            match entry {
                Value::Object(map) => node = map,
                _ => return Err(StoreError::InvalidPath(path.to_string())),
            }
        }
        if value.is_null() {
            node.remove(*last);
        } else {
            node.insert(last.to_string(), value);
        }
        self.notify(path);
        Ok(())
    }

    fn notify(&mut self, changed: &str) {
        let values: Vec<(u64, Value)> = self
            .subscribers
            .iter()
            .filter(|s| overlaps(&s.path, changed))
            .map(|s| (s.id, self.get(&s.path)))
            .collect();
        for (id, value) in values {
            if let Some(sub) = self.subscribers.iter().find(|s| s.id == id) {
                let _ = sub.tx.send(value);
            }
        }
        self.subscribers.retain(|s| !s.tx.is_closed());
    }
}

impl MemoryRealtimeDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DbInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn value_at(&self, path: &str) -> Value {
        self.lock().get(path)
    }

    /// Имитирует обрыв соединения клиента: выполняются отложенные записи
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        let pending: Vec<(String, Value)> = inner.on_disconnect.drain(..).collect();
        for (path, value) in pending {
            if let Err(e) = inner.put(&path, value) {
                crate::logger::warn(&format!("On-disconnect write to {path} failed: {e}"));
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

#[async_trait]
impl RealtimeDb for MemoryRealtimeDb {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.lock().put(path, value)
    }

    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        path_segments(path)?;
        self.lock().on_disconnect.push((path.to_string(), value));
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ValueSubscription, StoreError> {
        path_segments(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        let _ = tx.send(inner.get(path));
        inner.subscribers.push(DbSubscriber {
            id,
            path: path.to_string(),
            tx,
        });

        let weak = Arc::downgrade(&self.inner);
        Ok(ValueSubscription {
            values: rx,
            unsubscribe: Unsubscribe::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.subscribers.retain(|s| s.id != id);
                }
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::settle;

    #[tokio::test]
    async fn presence_goes_offline_on_disconnect() {
        let db = MemoryRealtimeDb::new();
        let alice = CurrentUser::new("alice");
        wire_presence(&db, Some(&alice)).await.unwrap();
        assert_eq!(db.value_at("status/alice")["state"], "online");

        let online_at = db.value_at("status/alice")["last_changed"].as_i64().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let before_disconnect = now_millis();
        db.disconnect();

        let status = db.value_at("status/alice");
        assert_eq!(status["state"], "offline");
        let offline_at = status["last_changed"].as_i64().unwrap();
        assert!(offline_at >= before_disconnect);
        assert!(offline_at > online_at);
    }

    #[test]
    fn server_timestamp_is_resolved_at_any_depth() {
        let mut value = json!({ "a": server_timestamp(), "b": [server_timestamp(), 1], "c": "x" });
        resolve_server_values(&mut value, 42);
        assert_eq!(value, json!({ "a": 42, "b": [42, 1], "c": "x" }));
    }

    #[tokio::test]
    async fn writes_without_user_do_nothing() {
        let db = MemoryRealtimeDb::new();
        wire_presence(&db, None).await.unwrap();
        set_typing(&db, "c1", None, true).await.unwrap();
        db.disconnect();
        assert_eq!(db.value_at("status"), Value::Null);
        assert_eq!(db.value_at("typing"), Value::Null);
    }

    #[tokio::test]
    async fn typing_map_excludes_current_user() {
        let db = MemoryRealtimeDb::new();
        let alice = CurrentUser::new("alice");
        let bob = CurrentUser::new("bob");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watch = subscribe_typing(&db, "c1", Some(&alice), move |map| {
            sink.lock().unwrap().push(map);
        })
        .await
        .unwrap();

        set_typing(&db, "c1", Some(&alice), true).await.unwrap();
        set_typing(&db, "c1", Some(&bob), true).await.unwrap();
        set_typing(&db, "c1", Some(&bob), false).await.unwrap();
        set_typing(&db, "other", Some(&bob), true).await.unwrap();
        settle().await;

        let seen = seen.lock().unwrap();
        // начальный снимок + три записи в c1
        assert_eq!(seen.len(), 4);
        assert!(seen[0].is_empty());
        assert!(seen[1].is_empty());
        assert_eq!(seen[2].get("bob"), Some(&1));
        assert_eq!(seen[3].get("bob"), Some(&0));
        assert!(seen.iter().all(|m| !m.contains_key("alice")));
    }

    #[tokio::test]
    async fn typing_without_user_is_unfiltered() {
        let db = MemoryRealtimeDb::new();
        set_typing(&db, "c1", Some(&CurrentUser::new("bob")), true)
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watch = subscribe_typing(&db, "c1", None, move |map| {
            sink.lock().unwrap().push(map);
        })
        .await
        .unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap()[0].get("bob"), Some(&1));
    }

    #[tokio::test]
    async fn dropping_watch_unsubscribes() {
        let db = MemoryRealtimeDb::new();
        let watch = subscribe_typing(&db, "c1", None, |_| {}).await.unwrap();
        assert_eq!(db.subscriber_count(), 1);
        drop(watch);
        assert_eq!(db.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn empty_segments_are_rejected() {
        let db = MemoryRealtimeDb::new();
        assert!(matches!(
            db.set("typing//bob", json!(1)).await,
            Err(StoreError::InvalidPath(_))
        ));
    }
}
