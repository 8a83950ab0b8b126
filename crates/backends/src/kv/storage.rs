use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use kestrel_api::{Storage, StorageError, StorageResult, WatchHandle};
use kestrel_core::{join_key, validate_key, Codec, Event, Layout, Object, Selector};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{KvClient, KvEvent, KvEventKind};
use crate::deleted_from_path;

/// `Storage` over a key-value store; keys are `{prefix}/{key}`.
pub struct KvStorage<T: Object> {
    client: Arc<dyn KvClient>,
    codec: Arc<dyn Codec<T>>,
    prefix: String,
    layout: Layout,
    capacity: usize,
    watches: Mutex<Vec<CancellationToken>>,
}

fn decode_opt<T>(codec: &dyn Codec<T>, key: &str, raw: Option<&[u8]>) -> Option<T> {
    let raw = raw.filter(|r| !r.is_empty())?;
    match codec.decode(raw) {
        Ok(obj) => Some(obj),
        Err(e) => {
            counter!("backend_decode_errors_total", 1, "backend" => "kv");
            warn!(key = %key, error = %e, "kv: decode failed; skipping");
            None
        }
    }
}

/// Map one raw notification to the event a watcher with `selector` should see.
///
/// Puts are re-evaluated against the selector on both values: both match is `Updated`,
/// only the new one `Added`, only the old one `Deleted(old)`. Deletions report the
/// previous value, or an object rebuilt from the key when none was supplied.
pub fn translate<T: Object>(ev: &KvEvent, codec: &dyn Codec<T>, selector: &Selector, layout: Layout) -> Option<Event<T>> {
    match ev.kind {
        KvEventKind::Put => {
            let cur = decode_opt(codec, &ev.key, Some(ev.value.as_slice()))?;
            let cur_ok = selector.matches_object(&cur);
            if ev.is_create {
                return cur_ok.then_some(Event::Added(cur));
            }
            let prev = decode_opt(codec, &ev.key, ev.prev_value.as_deref());
            let prev_ok = prev.as_ref().map(|p| selector.matches_object(p)).unwrap_or(false);
            match (prev_ok, cur_ok) {
                (true, true) => Some(Event::Updated(cur)),
                (false, true) => Some(Event::Added(cur)),
                (true, false) => prev.map(Event::Deleted),
                (false, false) => None,
            }
        }
        KvEventKind::Delete => match decode_opt::<T>(codec, &ev.key, ev.prev_value.as_deref()) {
            Some(prev) => selector.matches_object(&prev).then_some(Event::Deleted(prev)),
            None => {
                let obj: T = deleted_from_path(&ev.key, layout);
                selector.matches_identity(obj.meta()).then_some(Event::Deleted(obj))
            }
        },
    }
}

impl<T: Object> KvStorage<T> {
    pub fn new(client: Arc<dyn KvClient>, codec: Arc<dyn Codec<T>>, prefix: &str, layout: Layout) -> Self {
        Self { client, codec, prefix: prefix.to_string(), layout, capacity: 128, watches: Mutex::new(Vec::new()) }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn path(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(join_key(&self.prefix, key))
    }
}

#[async_trait::async_trait]
impl<T: Object> Storage<T> for KvStorage<T> {
    async fn create(&self, key: &str, obj: &T, ttl_secs: u64) -> StorageResult<Option<T>> {
        let path = self.path(key)?;
        let data = self.codec.encode(obj)?;
        let ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs));
        let prev = self.client.put(&path, &data, ttl).await?;
        info!(key = %path, "kv: put ok");
        Ok(decode_opt(self.codec.as_ref(), &path, prev.as_deref()))
    }

    async fn delete(&self, key: &str) -> StorageResult<Option<T>> {
        let path = self.path(key)?;
        match self.client.delete(&path).await? {
            Some(prev) => {
                info!(key = %path, "kv: delete ok");
                Ok(decode_opt(self.codec.as_ref(), &path, Some(prev.as_slice())))
            }
            None => Err(StorageError::NotFound(path)),
        }
    }

    async fn get(&self, key: &str, ignore_not_found: bool) -> StorageResult<Option<T>> {
        let path = self.path(key)?;
        match self.client.get(&path).await? {
            Some(raw) => Ok(Some(self.codec.decode(&raw)?)),
            None if ignore_not_found => Ok(None),
            None => Err(StorageError::NotFound(path)),
        }
    }

    async fn list(&self, key: &str, selector: &Selector) -> StorageResult<Vec<T>> {
        let path = self.path(key)?;
        let items = self.client.range(&path).await?;
        let out: Vec<T> = items
            .iter()
            .filter_map(|(k, v)| decode_opt(self.codec.as_ref(), k, Some(v.as_slice())))
            .filter(|o| selector.matches_object(o))
            .collect();
        debug!(key = %path, items = out.len(), "kv: list ok");
        Ok(out)
    }

    async fn watch(&self, key: &str, selector: &Selector) -> StorageResult<WatchHandle<T>> {
        let path = self.path(key)?;
        let mut stream = self.client.watch_prefix(&path).await?;
        let (tx, handle) = WatchHandle::channel(self.capacity);
        let token = handle.cancel_token();
        {
            let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            watches.retain(|t| !t.is_cancelled());
            watches.push(token.clone());
        }
        let codec = Arc::clone(&self.codec);
        let sel = selector.clone();
        let layout = self.layout;
        let key = path.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => {
                        let Some(ev) = next else {
                            debug!(key = %key, "kv: watch stream ended");
                            break;
                        };
                        if let Some(out) = translate(&ev, codec.as_ref(), &sel, layout) {
                            if !tx.send(out).await { break; }
                        }
                    }
                }
            }
        });
        info!(key = %path, selector = %selector, "kv: watch start");
        Ok(handle)
    }

    async fn close(&self) {
        let watches = std::mem::take(&mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner));
        for t in &watches {
            t.cancel();
        }
        info!(prefix = %self.prefix, watches = watches.len(), "kv: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{is_synthesized, JsonCodec, LabelSelector, RawObject};

    fn enc(o: &RawObject) -> Vec<u8> { serde_json::to_vec(o).unwrap() }

    fn labelled(name: &str, tier: &str) -> RawObject {
        let mut o = RawObject::new(Some("ns1"), name);
        o.meta.labels.insert("tier".into(), tier.into());
        o
    }

    fn web() -> Selector { Selector::labels(LabelSelector::new().equals("tier", "web")) }

    fn run(ev: KvEvent) -> Option<Event<RawObject>> {
        translate(&ev, &JsonCodec::<RawObject>::new(), &web(), Layout::Namespaced)
    }

    #[test]
    fn modify_is_reevaluated_on_both_values() {
        let (w, d) = (labelled("a", "web"), labelled("a", "db"));
        assert_eq!(run(KvEvent::put("/k/apps/ns1/a", &enc(&w), Some(enc(&w)))), Some(Event::Updated(w.clone())));
        assert_eq!(run(KvEvent::put("/k/apps/ns1/a", &enc(&w), Some(enc(&d)))), Some(Event::Added(w.clone())));
        assert_eq!(run(KvEvent::put("/k/apps/ns1/a", &enc(&d), Some(enc(&w)))), Some(Event::Deleted(w)));
        assert_eq!(run(KvEvent::put("/k/apps/ns1/a", &enc(&d), Some(enc(&d)))), None);
    }

    #[test]
    fn create_and_delete() {
        let w = labelled("a", "web");
        assert_eq!(run(KvEvent::put("/k/apps/ns1/a", &enc(&w), None)), Some(Event::Added(w.clone())));
        assert_eq!(run(KvEvent::put("/k/apps/ns1/b", &enc(&labelled("b", "db")), None)), None);
        assert_eq!(run(KvEvent::delete("/k/apps/ns1/a", Some(enc(&w)))), Some(Event::Deleted(w)));
        assert_eq!(run(KvEvent::delete("/k/apps/ns1/b", Some(enc(&labelled("b", "db"))))), None);
    }

    #[test]
    fn delete_without_previous_value_is_rebuilt_from_key() {
        match run(KvEvent::delete("/k/apps/ns1/gone", None)) {
            Some(Event::Deleted(o)) => {
                assert_eq!(o.identity(), (Some("ns1"), "gone"));
                assert!(is_synthesized(&o));
            }
            other => panic!("unexpected {other:?}"),
        }
        let ns2 = Selector::namespace("ns2");
        let ev = KvEvent::delete("/k/apps/ns1/gone", None);
        assert_eq!(translate::<RawObject>(&ev, &JsonCodec::new(), &ns2, Layout::Namespaced), None);
    }

    #[test]
    fn undecodable_values_are_dropped() {
        assert_eq!(run(KvEvent::put("/k/apps/ns1/a", b"{oops", None)), None);
    }
}
