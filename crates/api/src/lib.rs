//! Kestrel storage contracts.
//!
//! Backends (coordination tree, key-value, HTTP) and the `Cacher` facade all implement
//! [`Storage`]; consumers receive changes either through a [`WatchHandle`] or through an
//! [`EventHandler`] driven by a reflector.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use kestrel_core::{CoreError, Event, Object, Selector};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Storage errors suitable for surfacing to the immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("invalid_key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("backend: {0}")]
    Backend(String),
    #[error("config: {0}")]
    Config(String),
    #[error("closed")]
    Closed,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool { matches!(self, StorageError::NotFound(_)) }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Uniform remote-access contract. An empty key means everything under the backend's scope.
#[async_trait::async_trait]
pub trait Storage<T: Object>: Send + Sync {
    /// Create or replace the object at `key`; returns the previous value if any.
    /// `ttl_secs == 0` means no expiry. Whether a replacement renews the lifetime is up to
    /// the backend: the key-value store starts a new lease, the coordination tree keeps the
    /// TTL the node was created with and restarts its countdown on every write.
    async fn create(&self, key: &str, obj: &T, ttl_secs: u64) -> StorageResult<Option<T>>;

    /// Delete the object at `key`; returns the previous value when the backend knows it.
    async fn delete(&self, key: &str) -> StorageResult<Option<T>>;

    /// Fetch one object. Missing keys are `Ok(None)` with `ignore_not_found`, `NotFound` otherwise.
    async fn get(&self, key: &str, ignore_not_found: bool) -> StorageResult<Option<T>>;

    /// List every object at or below `key` accepted by `selector`.
    async fn list(&self, key: &str, selector: &Selector) -> StorageResult<Vec<T>>;

    /// Watch every object at or below `key` accepted by `selector`.
    async fn watch(&self, key: &str, selector: &Selector) -> StorageResult<WatchHandle<T>>;

    async fn watch_list(&self, key: &str, selector: &Selector) -> StorageResult<WatchHandle<T>> {
        self.watch(key, selector).await
    }

    async fn close(&self);
}

/// Consumer side of a watch. Dropping the handle stops the producer.
pub struct WatchHandle<T> {
    rx: mpsc::Receiver<Event<T>>,
    cancel: CancellationToken,
}

impl<T> WatchHandle<T> {
    pub fn new(rx: mpsc::Receiver<Event<T>>, cancel: CancellationToken) -> Self { Self { rx, cancel } }

    /// Bounded producer/consumer pair sharing one cancellation token.
    pub fn channel(cap: usize) -> (WatchSender<T>, WatchHandle<T>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        let cancel = CancellationToken::new();
        (WatchSender { tx, cancel: cancel.clone() }, WatchHandle { rx, cancel })
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<Event<T>> { self.rx.recv().await }

    pub fn try_recv(&mut self) -> Option<Event<T>> { self.rx.try_recv().ok() }

    /// Stop the producer. Idempotent.
    pub fn stop(&self) { self.cancel.cancel(); }

    pub fn is_stopped(&self) -> bool { self.cancel.is_cancelled() }

    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }
}

impl<T> Drop for WatchHandle<T> {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// Producer side of a watch.
pub struct WatchSender<T> {
    tx: mpsc::Sender<Event<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for WatchSender<T> {
    fn clone(&self) -> Self { Self { tx: self.tx.clone(), cancel: self.cancel.clone() } }
}

impl<T: Send> WatchSender<T> {
    /// Deliver one event, waiting for room. Returns false once the watch is stopped or dropped.
    pub async fn send(&self, ev: Event<T>) -> bool {
        if self.cancel.is_cancelled() { return false; }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(ev) => res.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool { self.cancel.is_cancelled() || self.tx.is_closed() }

    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Resolves when the consumer stops or drops the handle.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// Callbacks invoked sequentially by a reflector. Implementations must not block indefinitely.
#[async_trait::async_trait]
pub trait EventHandler<T: Object>: Send + Sync {
    async fn on_add(&self, obj: &T);
    async fn on_update(&self, old: &T, new: &T);
    async fn on_delete(&self, obj: &T);
}

pub struct NoopHandler;

#[async_trait::async_trait]
impl<T: Object> EventHandler<T> for NoopHandler {
    async fn on_add(&self, _obj: &T) {}
    async fn on_update(&self, _old: &T, _new: &T) {}
    async fn on_delete(&self, _obj: &T) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callback<T> {
    Add(T),
    Update(T, T),
    Delete(T),
}

/// Handler that records every callback; handy for tests and debugging.
pub struct RecordingHandler<T> {
    calls: Mutex<Vec<Callback<T>>>,
}

impl<T: Object> RecordingHandler<T> {
    pub fn new() -> Arc<Self> { Arc::new(Self { calls: Mutex::new(Vec::new()) }) }

    pub fn calls(&self) -> Vec<Callback<T>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take(&self) -> Vec<Callback<T>> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn push(&self, c: Callback<T>) { self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(c); }
}

#[async_trait::async_trait]
impl<T: Object> EventHandler<T> for RecordingHandler<T> {
    async fn on_add(&self, obj: &T) { self.push(Callback::Add(obj.clone())); }
    async fn on_update(&self, old: &T, new: &T) { self.push(Callback::Update(old.clone(), new.clone())); }
    async fn on_delete(&self, obj: &T) { self.push(Callback::Delete(obj.clone())); }
}

/// A lister/watcher pair: one storage query (key prefix + selector).
pub struct ListWatch<T: Object> {
    storage: Arc<dyn Storage<T>>,
    key: String,
    selector: Selector,
}

impl<T: Object> Clone for ListWatch<T> {
    fn clone(&self) -> Self { Self { storage: Arc::clone(&self.storage), key: self.key.clone(), selector: self.selector.clone() } }
}

impl<T: Object> ListWatch<T> {
    pub fn new(storage: Arc<dyn Storage<T>>, key: &str, selector: Selector) -> Self {
        Self { storage, key: key.to_string(), selector }
    }

    pub fn key(&self) -> &str { &self.key }
    pub fn selector(&self) -> &Selector { &self.selector }
    pub fn storage(&self) -> &Arc<dyn Storage<T>> { &self.storage }

    pub async fn list(&self) -> StorageResult<Vec<T>> { self.storage.list(&self.key, &self.selector).await }

    pub async fn watch(&self) -> StorageResult<WatchHandle<T>> { self.storage.watch_list(&self.key, &self.selector).await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::RawObject;
    use std::time::Duration;

    #[tokio::test]
    async fn dropping_handle_stops_sender() {
        let (tx, h) = WatchHandle::<RawObject>::channel(1);
        assert!(tx.send(Event::Added(RawObject::new(None, "a"))).await);
        drop(h);
        assert!(tx.is_closed());
        assert!(!tx.send(Event::Added(RawObject::new(None, "b"))).await);
    }

    #[tokio::test]
    async fn stop_unblocks_full_sender() {
        let (tx, h) = WatchHandle::<RawObject>::channel(1);
        assert!(tx.send(Event::Added(RawObject::new(None, "a"))).await);
        let pending = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(Event::Added(RawObject::new(None, "b"))).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.stop();
        let sent = tokio::time::timeout(Duration::from_secs(1), pending).await.expect("send did not unblock").expect("join");
        assert!(!sent);
        assert!(h.is_stopped());
    }

    #[tokio::test]
    async fn recording_handler_keeps_order() {
        let h = RecordingHandler::<RawObject>::new();
        let a = RawObject::new(Some("ns"), "a");
        h.on_add(&a).await;
        h.on_update(&a, &a).await;
        h.on_delete(&a).await;
        assert_eq!(h.take(), vec![Callback::Add(a.clone()), Callback::Update(a.clone(), a.clone()), Callback::Delete(a)]);
        assert!(h.calls().is_empty());
    }
}
