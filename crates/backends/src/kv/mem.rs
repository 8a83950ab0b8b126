//! In-process key-value store with prefix watches and TTL.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{under_prefix, KvClient, KvEvent, KvResult};

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, (Vec<u8>, u64)>,
    revision: u64,
    watchers: Vec<(String, mpsc::UnboundedSender<KvEvent>)>,
}

impl Inner {
    fn notify(&mut self, ev: KvEvent) {
        self.watchers.retain(|(prefix, tx)| !under_prefix(&ev.key, prefix) || tx.send(ev.clone()).is_ok());
    }

    fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let prev = self.data.remove(key).map(|(v, _)| v);
        if prev.is_some() {
            self.notify(KvEvent::delete(key, prev.clone()));
        }
        prev
    }
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemKv {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// End every open watch stream, as a server-side cancel would.
    pub fn drop_watches(&self) { self.lock().watchers.clear(); }

    pub fn watcher_count(&self) -> usize { self.lock().watchers.iter().filter(|(_, tx)| !tx.is_closed()).count() }

    pub fn len(&self) -> usize { self.lock().data.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl KvClient for MemKv {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> { Ok(self.lock().data.get(key).map(|(v, _)| v.clone())) }

    async fn range(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        Ok(self.lock().data.iter().filter(|(k, _)| under_prefix(k, prefix)).map(|(k, (v, _))| (k.clone(), v.clone())).collect())
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> KvResult<Option<Vec<u8>>> {
        let (prev, rev) = {
            let mut inner = self.lock();
            inner.revision += 1;
            let rev = inner.revision;
            let prev = inner.data.insert(key.to_string(), (value.to_vec(), rev)).map(|(v, _)| v);
            inner.notify(KvEvent::put(key, value, prev.clone()));
            (prev, rev)
        };
        if let Some(ttl) = ttl {
            let me = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let mut inner = me.lock();
                if inner.data.get(&key).map(|(_, r)| *r == rev).unwrap_or(false) {
                    debug!(key = %key, "kv: lease expired");
                    inner.remove(&key);
                }
            });
        }
        Ok(prev)
    }

    async fn delete(&self, key: &str) -> KvResult<Option<Vec<u8>>> { Ok(self.lock().remove(key)) }

    async fn watch_prefix(&self, prefix: &str) -> KvResult<BoxStream<'static, KvEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push((prefix.to_string(), tx));
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::KvEventKind;

    #[tokio::test]
    async fn watch_carries_previous_values() {
        let kv = MemKv::new();
        let mut w = kv.watch_prefix("/k/apps").await.unwrap();
        kv.put("/k/apps/a", b"1", None).await.unwrap();
        kv.put("/k/apps/a", b"2", None).await.unwrap();
        kv.put("/k/jobs/x", b"1", None).await.unwrap();
        kv.delete("/k/apps/a").await.unwrap();

        let first = w.next().await.unwrap();
        assert!(first.is_create);
        let second = w.next().await.unwrap();
        assert_eq!(second.prev_value.as_deref(), Some(&b"1"[..]));
        let third = w.next().await.unwrap();
        assert_eq!(third.kind, KvEventKind::Delete);
        assert_eq!(third.prev_value.as_deref(), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn dropping_watches_ends_streams() {
        let kv = MemKv::new();
        let mut w = kv.watch_prefix("/").await.unwrap();
        assert_eq!(kv.watcher_count(), 1);
        kv.drop_watches();
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn lease_expiry_deletes_key() {
        let kv = MemKv::new();
        kv.put("/k/a", b"1", Some(Duration::from_millis(30))).await.unwrap();
        assert_eq!(kv.range("/k").await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(kv.is_empty());
        assert_eq!(kv.delete("/k/a").await.unwrap(), None);
    }
}
