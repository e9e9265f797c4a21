//! The replicated key-value status document.

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{ClientError, ClientResult};

/// The device's key-value state, replicated locally.
///
/// Two writers touch it: the receive loop (full/delta merges) and the
/// calling task (speculative writes from `set`), so every access goes
/// through the one lock.
#[derive(Debug, Default)]
pub(crate) struct StatusDocument {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Set once the first complete (non-partial) full status is applied.
    /// Property access fails with `NotReady` until then.
    synced: bool,
    values: Map<String, Value>,
}

impl StatusDocument {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Shallow-merge an update: every incoming key overwrites the local
    /// one, keys absent from the update stay untouched. Nested values are
    /// replaced whole, never merged.
    pub(crate) async fn merge(&self, update: Map<String, Value>) {
        let mut inner = self.inner.write().await;
        for (key, value) in update {
            inner.values.insert(key, value);
        }
    }

    /// Record that the first complete full status has been applied.
    pub(crate) async fn mark_synced(&self) {
        self.inner.write().await.synced = true;
    }

    pub(crate) async fn get(&self, key: &str) -> ClientResult<Value> {
        let inner = self.inner.read().await;
        if !inner.synced {
            return Err(ClientError::NotReady);
        }
        inner
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_owned()))
    }

    /// Validate that `key` is writable: the document must be synced and
    /// the key must already exist. A set never inserts a new key.
    pub(crate) async fn ensure_known(&self, key: &str) -> ClientResult<()> {
        let inner = self.inner.read().await;
        if !inner.synced {
            return Err(ClientError::NotReady);
        }
        if !inner.values.contains_key(key) {
            return Err(ClientError::NotFound(key.to_owned()));
        }
        Ok(())
    }

    /// Apply a local write after the update message went out. The device
    /// stays authoritative: its next delta or full status overwrites this
    /// value if it disagrees.
    pub(crate) async fn commit(&self, key: &str, value: Value) {
        self.inner.write().await.values.insert(key.to_owned(), value);
    }

    pub(crate) async fn snapshot(&self) -> ClientResult<Map<String, Value>> {
        let inner = self.inner.read().await;
        if !inner.synced {
            return Err(ClientError::NotReady);
        }
        Ok(inner.values.clone())
    }
}
