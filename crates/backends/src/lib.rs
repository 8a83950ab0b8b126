//! Kestrel backends: the `Storage` implementations for each kind of remote store.
//!
//! - [`tree`]: hierarchical coordination service with single-node watches only; subtree
//!   watching is rebuilt by the recursive tree watcher.
//! - [`kv`]: key-value store with native prefix watches carrying previous values.
//! - [`http`]: HTTP event API streaming newline-delimited JSON envelopes.

#![forbid(unsafe_code)]

use kestrel_core::{split_key, synthesize_deleted, Layout, Object};

pub mod http;
pub mod kv;
pub mod tree;

pub use http::{client_with_timeout, HttpStorage};
pub use kv::{KvClient, KvStorage, MemKv};
pub use tree::{MemTree, TreeClient, TreeStorage, TreeWatchConfig};

/// Recover `(namespace, name)` from the trailing segments of a backend path.
pub(crate) fn identity_from_path(path: &str, layout: Layout) -> (Option<String>, String) {
    let segs = split_key(path);
    let name = segs.last().map(|s| s.to_string()).unwrap_or_default();
    let namespace = match layout {
        Layout::Namespaced if segs.len() >= 2 => Some(segs[segs.len() - 2].to_string()),
        _ => None,
    };
    (namespace, name)
}

/// Minimal stand-in for an object deleted at `path`.
pub(crate) fn deleted_from_path<T: Object>(path: &str, layout: Layout) -> T {
    let (ns, name) = identity_from_path(path, layout);
    synthesize_deleted(ns.as_deref(), &name)
}
