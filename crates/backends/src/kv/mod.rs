//! Key-value backend with native prefix watches.
//!
//! Watch notifications carry both the new and the previous value, so selector changes
//! can be reported precisely: an object moving out of the selector surfaces as `Deleted`.

use std::time::Duration;

use futures::stream::BoxStream;
use kestrel_api::StorageError;

mod mem;
mod storage;

pub use mem::MemKv;
pub use storage::{translate, KvStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// One change notification from a prefix watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    /// New value; empty for deletions.
    pub value: Vec<u8>,
    pub prev_value: Option<Vec<u8>>,
    /// The put created the key rather than replacing it.
    pub is_create: bool,
}

impl KvEvent {
    pub fn put(key: &str, value: &[u8], prev_value: Option<Vec<u8>>) -> Self {
        let is_create = prev_value.is_none();
        Self { kind: KvEventKind::Put, key: key.to_string(), value: value.to_vec(), prev_value, is_create }
    }

    pub fn delete(key: &str, prev_value: Option<Vec<u8>>) -> Self {
        Self { kind: KvEventKind::Delete, key: key.to_string(), value: Vec::new(), prev_value, is_create: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("connection: {0}")]
    Connection(String),
}

impl From<KvError> for StorageError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::KeyNotFound(k) => StorageError::NotFound(k),
            KvError::Connection(m) => StorageError::Backend(m),
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

#[async_trait::async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Every `(key, value)` equal to `prefix` or below `prefix/`, sorted by key.
    async fn range(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>>;

    /// Store a value; returns the previous one.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> KvResult<Option<Vec<u8>>>;

    /// Remove a key; returns the previous value, `None` when it was absent.
    async fn delete(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Changes to keys equal to `prefix` or below `prefix/`. The stream ends when the
    /// server drops the watch.
    async fn watch_prefix(&self, prefix: &str) -> KvResult<BoxStream<'static, KvEvent>>;
}

/// Whether `key` is `prefix` itself or lies below it.
pub(crate) fn under_prefix(key: &str, prefix: &str) -> bool {
    let p = prefix.trim_end_matches('/');
    p.is_empty() || key == p || key.strip_prefix(p).map(|rest| rest.starts_with('/')).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_respects_segment_boundaries() {
        assert!(under_prefix("/k/apps/ns1/a", "/k/apps/ns1"));
        assert!(under_prefix("/k/apps/ns1", "/k/apps/ns1"));
        assert!(!under_prefix("/k/apps/ns10/a", "/k/apps/ns1"));
        assert!(under_prefix("/anything", "/"));
    }

    #[test]
    fn put_marks_creation() {
        assert!(KvEvent::put("/a", b"1", None).is_create);
        assert!(!KvEvent::put("/a", b"2", Some(b"1".to_vec())).is_create);
    }
}
