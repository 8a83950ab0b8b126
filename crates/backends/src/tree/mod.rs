//! Coordination-tree backend.
//!
//! The service exposes a hierarchy of nodes, each holding an optional payload, and
//! one-shot watches on a single node's data or on its direct children. Objects live at
//! `{prefix}/{type}/{namespace}/{name}` (or `{prefix}/{type}/{name}` for flat kinds);
//! intermediate nodes are payload-less containment nodes.

use std::time::Duration;

use kestrel_api::StorageError;
use tokio::sync::oneshot;

mod layer;
mod mem;
mod storage;
mod watcher;

pub use layer::{layers_for, Layer};
pub use mem::MemTree;
pub use storage::TreeStorage;
pub use watcher::{TreeWatchConfig, TreeWatcher};

/// One-shot notification delivered to a node watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Created,
    DataChanged,
    Deleted,
    ChildrenChanged,
}

/// Receiver side of a one-shot node watch. A dropped sender means the session lost the watch.
pub type NodeWatch = oneshot::Receiver<NodeEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("no node: {0}")]
    NoNode(String),
    #[error("node exists: {0}")]
    NodeExists(String),
    #[error("node not empty: {0}")]
    NotEmpty(String),
    #[error("bad path: {0}")]
    BadPath(String),
    #[error("connection: {0}")]
    Connection(String),
}

impl From<TreeError> for StorageError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NoNode(p) => StorageError::NotFound(p),
            TreeError::NodeExists(p) => StorageError::AlreadyExists(p),
            TreeError::BadPath(p) => StorageError::InvalidKey(p),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

pub type TreeResult<T> = Result<T, TreeError>;

/// Client for a hierarchical coordination service. Paths are absolute (`/a/b`).
#[async_trait::async_trait]
pub trait TreeClient: Send + Sync {
    async fn exists(&self, path: &str) -> TreeResult<bool>;

    /// Whether the node exists, plus a watch fired when it is created (or deleted, if present).
    async fn exists_w(&self, path: &str) -> TreeResult<(bool, NodeWatch)>;

    /// Payload of a node, `None` when missing.
    async fn get(&self, path: &str) -> TreeResult<Option<Vec<u8>>>;

    /// Payload plus a watch fired on the next data change or deletion of this node.
    async fn get_w(&self, path: &str) -> TreeResult<Option<(Vec<u8>, NodeWatch)>>;

    /// Names (not paths) of direct children. `NoNode` when the node is missing.
    async fn children(&self, path: &str) -> TreeResult<Vec<String>>;

    /// Children plus a watch fired on the next membership change or deletion of this node.
    async fn children_w(&self, path: &str) -> TreeResult<(Vec<String>, NodeWatch)>;

    /// Create a node, creating missing ancestors as empty containment nodes.
    async fn create(&self, path: &str, data: &[u8], ttl: Option<Duration>) -> TreeResult<()>;

    async fn set(&self, path: &str, data: &[u8]) -> TreeResult<()>;

    /// Delete a leaf node. Fails with `NotEmpty` when it still has children.
    async fn delete(&self, path: &str) -> TreeResult<()>;
}
