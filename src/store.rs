use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

/// Collection paths used by the client.
pub mod paths {
    pub const USERS: &str = "users";
    pub const ROOMS: &str = "rooms";

    pub fn user(uid: &str) -> String {
        format!("users/{uid}")
    }

    pub fn room(name: &str) -> String {
        format!("rooms/{name}")
    }

    pub fn messages(room: &str) -> String {
        format!("messages/{room}")
    }

    pub fn favorites(uid: &str) -> String {
        format!("favorites/{uid}")
    }

    pub fn favorite(uid: &str, message_id: &str) -> String {
        format!("favorites/{uid}/{message_id}")
    }
}

/// Field value replaced by the store with its own clock at write time.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

fn is_timestamp_sentinel(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.get(".sv").and_then(Value::as_str) == Some("timestamp"))
}

fn resolve_sentinels(value: &mut Value, now: i64) {
    if is_timestamp_sentinel(value) {
        *value = Value::from(now);
        return;
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                resolve_sentinels(child, now);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                resolve_sentinels(child, now);
            }
        }
        _ => {}
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Value,
    ChildAdded,
    ChildRemoved,
}

/// Full point-in-time value of a collection, children in sort order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub entries: Vec<(String, Value)>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub enum Notification {
    Value {
        path: String,
        snapshot: Snapshot,
    },
    ChildAdded {
        path: String,
        key: String,
        value: Value,
    },
    ChildRemoved {
        path: String,
        key: String,
    },
}

/// The hosted realtime store, as consumed by the client: keyed writes and
/// per-path subscriptions delivering snapshots or incremental child events.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    async fn set_with_priority(&self, path: &str, value: Value, priority: f64) -> Result<()>;

    /// Merges the top-level fields of `value` into the record at `path`.
    async fn update(&self, path: &str, value: Value) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Appends a child under `path` with a generated key and returns it.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Registers `tx` for events of `kind` at `path`. The current state is
    /// delivered immediately: a full snapshot for `Value`, one `ChildAdded`
    /// per existing child for `ChildAdded`.
    async fn subscribe(
        &self,
        path: &str,
        kind: EventKind,
        tx: UnboundedSender<Notification>,
    ) -> Result<()>;

    /// Drops every listener of `kind` at `path`.
    async fn unsubscribe(&self, path: &str, kind: EventKind) -> Result<()>;
}

#[derive(Debug, Default)]
struct Node {
    value: Value,
    priority: Option<f64>,
    children: Vec<(String, Node)>, // insertion order
}

impl Node {
    fn child(&self, key: &str) -> Option<&Node> {
        self.children.iter().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    fn child_mut(&mut self, key: &str) -> &mut Node {
        if !self.children.iter().any(|(k, _)| k == key) {
            self.children.push((key.to_string(), Node::default()));
        }
        let (_, node) = self
            .children
            .iter_mut()
            .find(|(k, _)| k == key)
            .expect("child inserted above");
        node
    }

    fn descend(&self, path: &str) -> Option<&Node> {
        let mut node = self;
        for segment in path.split('/') {
            node = node.child(segment)?;
        }
        Some(node)
    }

    fn descend_mut(&mut self, path: &str) -> &mut Node {
        let mut node = self;
        for segment in path.split('/') {
            node = node.child_mut(segment);
        }
        node
    }

    fn to_value(&self) -> Value {
        if self.children.is_empty() {
            return self.value.clone();
        }
        let mut map = serde_json::Map::new();
        for (key, child) in &self.children {
            map.insert(key.clone(), child.to_value());
        }
        Value::Object(map)
    }

    /// Children ordered by priority, then insertion order.
    fn ordered_children(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(&String, &Node)> =
            self.children.iter().map(|(k, n)| (k, n)).collect();
        entries.sort_by(|(_, a), (_, b)| {
            let pa = a.priority.unwrap_or(0.0);
            let pb = b.priority.unwrap_or(0.0);
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
            .into_iter()
            .map(|(key, node)| (key.clone(), node.to_value()))
            .collect()
    }
}

#[derive(Default)]
struct Inner {
    root: Node,
    listeners: HashMap<(String, EventKind), Vec<UnboundedSender<Notification>>>,
}

impl Inner {
    fn snapshot(&self, path: &str) -> Snapshot {
        let entries = self
            .root
            .descend(path)
            .map(Node::ordered_children)
            .unwrap_or_default();
        Snapshot { entries }
    }

    fn send_all(&self, key: &(String, EventKind), make: impl Fn() -> Notification) {
        if let Some(txs) = self.listeners.get(key) {
            for tx in txs {
                let _ = tx.send(make());
            }
        }
    }

    /// Fires value snapshots for the written path and every ancestor.
    fn notify_value(&self, path: &str) {
        let segments: Vec<&str> = path.split('/').collect();
        for depth in (1..=segments.len()).rev() {
            let prefix = segments[..depth].join("/");
            let key = (prefix.clone(), EventKind::Value);
            if self.listeners.contains_key(&key) {
                let snapshot = self.snapshot(&prefix);
                self.send_all(&key, || Notification::Value {
                    path: prefix.clone(),
                    snapshot: snapshot.clone(),
                });
            }
        }
    }

    fn notify_child_added(&self, parent: &str, child_key: &str, value: &Value) {
        self.send_all(&(parent.to_string(), EventKind::ChildAdded), || {
            Notification::ChildAdded {
                path: parent.to_string(),
                key: child_key.to_string(),
                value: value.clone(),
            }
        });
    }

    fn notify_child_removed(&self, parent: &str, child_key: &str) {
        self.send_all(&(parent.to_string(), EventKind::ChildRemoved), || {
            Notification::ChildRemoved {
                path: parent.to_string(),
                key: child_key.to_string(),
            }
        });
    }

    fn write(&mut self, path: &str, mut value: Value, priority: Option<f64>) {
        resolve_sentinels(&mut value, now_millis());

        let (parent, child_key) = split_parent(path);
        let is_new = self
            .root
            .descend(parent)
            .and_then(|node| node.child(child_key))
            .is_none();

        let node = self.root.descend_mut(path);
        node.value = value.clone();
        node.children.clear();
        if priority.is_some() {
            node.priority = priority;
        }

        if is_new {
            self.notify_child_added(parent, child_key, &value);
        }
        self.notify_value(path);
    }

    fn merge(&mut self, path: &str, mut value: Value) {
        resolve_sentinels(&mut value, now_millis());

        let node = self.root.descend_mut(path);
        if !node.value.is_object() {
            node.value = Value::Object(serde_json::Map::new());
        }
        if let (Some(target), Some(fields)) = (node.value.as_object_mut(), value.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }

        self.notify_value(path);
    }

    fn delete(&mut self, path: &str) {
        let (parent, child_key) = split_parent(path);
        let Some(parent_node) = self.root.descend(parent) else {
            return;
        };
        if parent_node.child(child_key).is_none() {
            return;
        }

        let removed = {
            let parent_node = self.root.descend_mut(parent);
            let pos = parent_node
                .children
                .iter()
                .position(|(k, _)| k == child_key)
                .expect("checked above");
            parent_node.children.remove(pos).1
        };

        // Grandchildren are gone too; tell any incremental listeners at
        // the removed path before announcing the removal itself.
        for (key, _) in &removed.children {
            self.notify_child_removed(path, key);
        }
        self.notify_child_removed(parent, child_key);
        self.notify_value(path);
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, key)) => (parent, key),
        None => ("", path),
    }
}

/// In-process stand-in for the hosted store, used by tests and the demo
/// binary. Single tree of keyed records, listener fan-out per path.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of a collection, bypassing subscriptions. Test helper.
    pub async fn read(&self, path: &str) -> Snapshot {
        self.inner.read().await.snapshot(path)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.inner.write().await.write(path, value, None);
        Ok(())
    }

    async fn set_with_priority(&self, path: &str, value: Value, priority: f64) -> Result<()> {
        self.inner.write().await.write(path, value, Some(priority));
        Ok(())
    }

    async fn update(&self, path: &str, value: Value) -> Result<()> {
        self.inner.write().await.merge(path, value);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.inner.write().await.delete(path);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        let child_path = format!("{path}/{key}");
        self.inner.write().await.write(&child_path, value, None);
        Ok(key)
    }

    async fn subscribe(
        &self,
        path: &str,
        kind: EventKind,
        tx: UnboundedSender<Notification>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        // Initial delivery mirrors the hosted store: subscribing hands the
        // listener the current state before any change events.
        match kind {
            EventKind::Value => {
                let _ = tx.send(Notification::Value {
                    path: path.to_string(),
                    snapshot: inner.snapshot(path),
                });
            }
            EventKind::ChildAdded => {
                for (key, value) in inner.snapshot(path).entries {
                    let _ = tx.send(Notification::ChildAdded {
                        path: path.to_string(),
                        key,
                        value,
                    });
                }
            }
            EventKind::ChildRemoved => {}
        }

        inner
            .listeners
            .entry((path.to_string(), kind))
            .or_default()
            .push(tx);
        Ok(())
    }

    async fn unsubscribe(&self, path: &str, kind: EventKind) -> Result<()> {
        self.inner
            .write()
            .await
            .listeners
            .remove(&(path.to_string(), kind));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn set_resolves_timestamp_sentinels() {
        let store = MemoryStore::new();
        store
            .set("users/u1", json!({ "nickname": "a", "createdAt": server_timestamp() }))
            .await
            .unwrap();

        let snapshot = store.read("users").await;
        let created = snapshot.get("u1").unwrap()["createdAt"].as_i64().unwrap();
        assert!(created > 0);
    }

    #[tokio::test]
    async fn value_subscription_gets_initial_and_updated_snapshots() {
        let store = MemoryStore::new();
        let (tx, mut rx) = unbounded_channel();
        store.subscribe("rooms", EventKind::Value, tx).await.unwrap();

        match rx.try_recv().unwrap() {
            Notification::Value { snapshot, .. } => assert!(snapshot.is_empty()),
            other => panic!("unexpected notification: {other:?}"),
        }

        store
            .set("rooms/general", json!({ "createdByUID": "u1", "createdAt": 1 }))
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            Notification::Value { snapshot, .. } => {
                assert!(snapshot.contains_key("general"));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_orders_children_by_priority_then_insertion() {
        let store = MemoryStore::new();
        store
            .set_with_priority("rooms/zeta", json!({}), 2.0)
            .await
            .unwrap();
        store
            .set_with_priority("rooms/default", json!({}), 1.0)
            .await
            .unwrap();
        store
            .set_with_priority("rooms/alpha", json!({}), 2.0)
            .await
            .unwrap();

        let keys: Vec<String> = store
            .read("rooms")
            .await
            .entries
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["default", "zeta", "alpha"]);
    }

    #[tokio::test]
    async fn child_added_subscription_replays_existing_children_in_order() {
        let store = MemoryStore::new();
        let first = store.push("messages/default", json!({ "text": "one" })).await.unwrap();
        let second = store.push("messages/default", json!({ "text": "two" })).await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        store
            .subscribe("messages/default", EventKind::ChildAdded, tx)
            .await
            .unwrap();

        let mut keys = Vec::new();
        while let Ok(Notification::ChildAdded { key, .. }) = rx.try_recv() {
            keys.push(key);
        }
        assert_eq!(keys, [first, second]);
    }

    #[tokio::test]
    async fn remove_fires_child_removed_and_cascades_to_grandchildren() {
        let store = MemoryStore::new();
        let id = store.push("messages/team", json!({ "text": "hi" })).await.unwrap();

        let (room_tx, mut room_rx) = unbounded_channel();
        store
            .subscribe("rooms", EventKind::ChildRemoved, room_tx)
            .await
            .unwrap();
        let (msg_tx, mut msg_rx) = unbounded_channel();
        store
            .subscribe("messages/team", EventKind::ChildRemoved, msg_tx)
            .await
            .unwrap();

        store.set("rooms/team", json!({ "createdAt": 1 })).await.unwrap();
        store.remove("rooms/team").await.unwrap();
        store.remove("messages/team").await.unwrap();

        match room_rx.try_recv().unwrap() {
            Notification::ChildRemoved { key, .. } => assert_eq!(key, "team"),
            other => panic!("unexpected notification: {other:?}"),
        }
        match msg_rx.try_recv().unwrap() {
            Notification::ChildRemoved { key, .. } => assert_eq!(key, id),
            other => panic!("unexpected notification: {other:?}"),
        }
        assert!(store.read("messages/team").await.is_empty());
    }

    #[tokio::test]
    async fn update_merges_fields_without_clobbering() {
        let store = MemoryStore::new();
        store
            .set("users/u1", json!({ "nickname": "old", "createdAt": 1, "updatedAt": 1 }))
            .await
            .unwrap();
        store
            .update("users/u1", json!({ "nickname": "new", "updatedAt": server_timestamp() }))
            .await
            .unwrap();

        let snapshot = store.read("users").await;
        let user = snapshot.get("u1").unwrap();
        assert_eq!(user["nickname"], "new");
        assert_eq!(user["createdAt"], 1);
        assert!(user["updatedAt"].as_i64().unwrap() > 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let (tx, mut rx) = unbounded_channel();
        store.subscribe("users", EventKind::Value, tx).await.unwrap();
        let _ = rx.try_recv();

        store.unsubscribe("users", EventKind::Value).await.unwrap();
        store.set("users/u1", json!({ "nickname": "a" })).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
