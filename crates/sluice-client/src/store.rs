//! Reactive key -> record collection filled by a subscription.

use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;

/// A record that can be stored in a [`KeyedStore`].
pub trait Keyed {
    /// Identity of the record. `None` means the record cannot be stored.
    fn key(&self) -> Option<String>;
}

/// JSON records are keyed by their `"key"` field. Strings are used verbatim;
/// numbers and booleans use their JSON rendering.
impl Keyed for Value {
    fn key(&self) -> Option<String> {
        match self.get("key")? {
            Value::String(key) => Some(key.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Map from key to the most recently received record.
///
/// Writes are last-write-wins in arrival order. Observers get a
/// [`watch::Receiver`] that is notified after every upsert, so a UI can
/// re-render as results stream in. Clones share the same map.
#[derive(Debug)]
pub struct KeyedStore<R> {
    tx: Arc<watch::Sender<HashMap<String, R>>>,
}

impl<R> Clone for KeyedStore<R> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<R> Default for KeyedStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> KeyedStore<R> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashMap::new());
        Self { tx: Arc::new(tx) }
    }

    /// Inserts or replaces the record stored under `key` and notifies
    /// watchers.
    pub fn upsert(&self, key: String, record: R) {
        self.tx.send_modify(|records| {
            records.insert(key, record);
        });
    }

    /// Subscribes to changes. The receiver sees the current map immediately.
    pub fn watch(&self) -> watch::Receiver<HashMap<String, R>> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }
}

impl<R: Clone> KeyedStore<R> {
    pub fn get(&self, key: &str) -> Option<R> {
        self.tx.borrow().get(key).cloned()
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, R> {
        self.tx.borrow().clone()
    }
}
