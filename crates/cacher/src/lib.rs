//! Kestrel cacher: a `Storage` facade over one reflector and its local store.
//!
//! Reads are served from the local store. Writes go straight to the wrapped backend.
//! Watches are multiplexed: the reflector's callbacks feed one bounded intake, a single
//! dispatch task copies every event to every registered subscriber, and each subscriber
//! task applies its own key prefix and selector before forwarding to its handle.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use kestrel_api::{EventHandler, ListWatch, Storage, StorageError, StorageResult, WatchHandle, WatchSender};
use kestrel_core::{split_key, trim_key, Event, Object, ObjectKeyFunc, OverflowPolicy, Selector, Settings};
use kestrel_reflector::Reflector;
use kestrel_store::Indexer;
use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<Event<T>>,
    cancel: CancellationToken,
    dropped: AtomicU64,
}

struct Hub<T: Object> {
    name: String,
    subs: ArcSwap<Vec<Arc<Subscriber<T>>>>,
    policy: OverflowPolicy,
    capacity: usize,
    next_id: AtomicU64,
    closed: CancellationToken,
    intake_tx: mpsc::Sender<Event<T>>,
    intake_rx: Mutex<Option<mpsc::Receiver<Event<T>>>>,
    /// Set once `run` has started the dispatch task; until then nothing drains the intake.
    dispatching: AtomicBool,
    extra: Option<Arc<dyn EventHandler<T>>>,
}

impl<T: Object> Hub<T> {
    fn register(&self, sub: Arc<Subscriber<T>>) {
        self.subs.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(Arc::clone(&sub));
            next
        });
        gauge!("cacher_subscribers", self.subs.load().len() as f64, "cacher" => self.name.clone());
    }

    fn unregister(&self, id: u64) {
        self.subs.rcu(|cur| cur.iter().filter(|s| s.id != id).cloned().collect::<Vec<_>>());
        gauge!("cacher_subscribers", self.subs.load().len() as f64, "cacher" => self.name.clone());
    }

    async fn push(&self, ev: Event<T>) {
        if self.closed.is_cancelled() || !self.dispatching.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.intake_tx.send(ev) => {}
        }
    }

    /// Copy one event to every registered subscriber, honouring the overflow policy.
    async fn broadcast(&self, ev: Event<T>) {
        let subs = self.subs.load_full();
        for sub in subs.iter() {
            if sub.cancel.is_cancelled() {
                continue;
            }
            match self.policy {
                OverflowPolicy::Block => {
                    tokio::select! {
                        _ = sub.cancel.cancelled() => {}
                        _ = self.closed.cancelled() => return,
                        _ = sub.tx.send(ev.clone()) => {}
                    }
                }
                OverflowPolicy::DropNewest => {
                    if let Err(TrySendError::Full(_)) = sub.tx.try_send(ev.clone()) {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        counter!("cacher_dropped_events_total", 1, "cacher" => self.name.clone());
                        debug!(cacher = %self.name, subscriber = sub.id, "cacher: subscriber full; event dropped");
                    }
                }
                OverflowPolicy::Disconnect => {
                    if let Err(TrySendError::Full(_)) = sub.tx.try_send(ev.clone()) {
                        counter!("cacher_disconnects_total", 1, "cacher" => self.name.clone());
                        warn!(cacher = %self.name, subscriber = sub.id, "cacher: subscriber too slow; disconnecting");
                        self.unregister(sub.id);
                        sub.cancel.cancel();
                    }
                }
            }
        }
    }
}

/// Reflector callback feeding the hub.
struct HubHandler<T: Object> {
    hub: Arc<Hub<T>>,
}

#[async_trait::async_trait]
impl<T: Object> EventHandler<T> for HubHandler<T> {
    async fn on_add(&self, obj: &T) {
        if let Some(h) = &self.hub.extra {
            h.on_add(obj).await;
        }
        self.hub.push(Event::Added(obj.clone())).await;
    }

    async fn on_update(&self, old: &T, new: &T) {
        if let Some(h) = &self.hub.extra {
            h.on_update(old, new).await;
        }
        self.hub.push(Event::Updated(new.clone())).await;
    }

    async fn on_delete(&self, obj: &T) {
        if let Some(h) = &self.hub.extra {
            h.on_delete(obj).await;
        }
        self.hub.push(Event::Deleted(obj.clone())).await;
    }
}

/// Whether a store key lies under a (store-relative) key prefix.
fn key_matches(store_key: &str, prefix: &str) -> bool {
    prefix.is_empty() || store_key == prefix || store_key.strip_prefix(prefix).map(|r| r.starts_with('/')).unwrap_or(false)
}

async fn run_subscriber<T: Object>(
    hub: Arc<Hub<T>>,
    store: Arc<Indexer<T>>,
    id: u64,
    mut rx: mpsc::Receiver<Event<T>>,
    out: WatchSender<T>,
    prefix: Option<String>,
    selector: Selector,
) {
    let cancel = out.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(ev) = next else { break };
                let Some(obj) = ev.object() else { continue };
                let in_scope = match prefix.as_deref() {
                    Some(p) => store.key_of(obj).map(|k| key_matches(&k, p)).unwrap_or(false),
                    None => false,
                };
                if !in_scope || !selector.matches_object(obj) {
                    continue;
                }
                if !out.send(ev).await { break; }
            }
        }
    }
    hub.unregister(id);
    debug!(cacher = %hub.name, subscriber = id, "cacher: subscriber stopped");
}

pub struct CacherBuilder<T: Object> {
    name: String,
    backend: Arc<dyn Storage<T>>,
    key: String,
    selector: Selector,
    key_func: ObjectKeyFunc<T>,
    policy: OverflowPolicy,
    capacity: usize,
    resync_period: Option<Duration>,
    watch_health_interval: Option<Duration>,
    extra: Option<Arc<dyn EventHandler<T>>>,
}

impl<T: Object> CacherBuilder<T> {
    pub fn selector(mut self, s: Selector) -> Self {
        self.selector = s;
        self
    }

    pub fn key_func(mut self, f: ObjectKeyFunc<T>) -> Self {
        self.key_func = f;
        self
    }

    pub fn policy(mut self, p: OverflowPolicy) -> Self {
        self.policy = p;
        self
    }

    pub fn capacity(mut self, c: usize) -> Self {
        self.capacity = c.max(1);
        self
    }

    pub fn resync_period(mut self, d: Duration) -> Self {
        self.resync_period = Some(d);
        self
    }

    pub fn watch_health_interval(mut self, d: Duration) -> Self {
        self.watch_health_interval = Some(d);
        self
    }

    /// Extra handler called for every reflector callback before fan-out.
    pub fn handler(mut self, h: Arc<dyn EventHandler<T>>) -> Self {
        self.extra = Some(h);
        self
    }

    pub fn settings(self, s: &Settings) -> Self {
        self.policy(s.overflow)
            .capacity(s.queue_cap)
            .resync_period(s.resync_period())
            .watch_health_interval(s.watch_health_interval())
    }

    pub fn build(self) -> Arc<Cacher<T>> {
        let (intake_tx, intake_rx) = mpsc::channel(self.capacity);
        let hub = Arc::new(Hub {
            name: self.name.clone(),
            subs: ArcSwap::from_pointee(Vec::new()),
            policy: self.policy,
            capacity: self.capacity,
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            dispatching: AtomicBool::new(false),
            extra: self.extra,
        });
        let store = Arc::new(Indexer::new(self.key_func));
        let lw = ListWatch::new(Arc::clone(&self.backend), &self.key, self.selector);
        let mut rb = Reflector::builder(&self.name, lw, Arc::clone(&store)).handler(Arc::new(HubHandler { hub: Arc::clone(&hub) }));
        if let Some(d) = self.resync_period {
            rb = rb.resync_period(d);
        }
        if let Some(d) = self.watch_health_interval {
            rb = rb.watch_health_interval(d);
        }
        Arc::new(Cacher { hub, backend: self.backend, reflector: rb.build(), store, key: trim_key(&self.key).to_string() })
    }
}

pub struct Cacher<T: Object> {
    hub: Arc<Hub<T>>,
    backend: Arc<dyn Storage<T>>,
    reflector: Arc<Reflector<T>>,
    store: Arc<Indexer<T>>,
    key: String,
}

impl<T: Object> Cacher<T> {
    /// Cacher mirroring everything under `key` of `backend`.
    pub fn builder(name: &str, backend: Arc<dyn Storage<T>>, key: &str) -> CacherBuilder<T> {
        CacherBuilder {
            name: name.to_string(),
            backend,
            key: key.to_string(),
            selector: Selector::everything(),
            key_func: kestrel_core::namespace_key_func::<T>,
            policy: OverflowPolicy::default(),
            capacity: 128,
            resync_period: None,
            watch_health_interval: None,
            extra: None,
        }
    }

    /// Start the dispatch task and the reflector. Idempotent.
    ///
    /// Reflector callbacks only reach subscribers once this has run; a reflector driven by
    /// hand before that (`reflector().list_all_data()`) just fills the store.
    pub fn run(&self) {
        let rx = self.hub.intake_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut rx) = rx {
            let hub = Arc::clone(&self.hub);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = hub.closed.cancelled() => break,
                        next = rx.recv() => match next {
                            Some(ev) => hub.broadcast(ev).await,
                            None => break,
                        },
                    }
                }
                debug!(cacher = %hub.name, "cacher: dispatch stopped");
            });
            self.hub.dispatching.store(true, Ordering::SeqCst);
            info!(cacher = %self.hub.name, key = %self.key, policy = ?self.hub.policy, "cacher: run");
        }
        self.reflector.run();
    }

    pub fn name(&self) -> &str { &self.hub.name }
    pub fn store(&self) -> &Arc<Indexer<T>> { &self.store }
    pub fn reflector(&self) -> &Arc<Reflector<T>> { &self.reflector }
    pub fn subscriber_count(&self) -> usize { self.hub.subs.load().len() }
    pub fn is_closed(&self) -> bool { self.hub.closed.is_cancelled() }

    /// Events dropped for subscriber `id` under `DropNewest`; `None` once it is gone.
    pub fn dropped_for(&self, id: u64) -> Option<u64> {
        self.hub.subs.load().iter().find(|s| s.id == id).map(|s| s.dropped.load(Ordering::Relaxed))
    }

    /// Store-key prefix addressed by a backend key, or `None` when the key names another type.
    ///
    /// Backend keys are `type[/namespace[/name]]` (or `type[/name]` for flat kinds) while the
    /// store indexes objects by `namespace/name`, so the type segment is dropped and the rest
    /// kept: `apps/ns1/a` is `ns1/a` whether the cacher mirrors `apps`, `apps/ns1` or everything.
    /// A cacher over every type cannot tell types apart and accepts any type segment.
    fn scope(&self, key: &str) -> Option<String> {
        let segs = split_key(key);
        let Some((kind, rest)) = segs.split_first() else { return Some(String::new()) };
        match split_key(&self.key).first() {
            Some(own) if own != kind => None,
            _ => Some(rest.join("/")),
        }
    }

    fn subscribe(&self, key: &str, selector: &Selector) -> StorageResult<(u64, WatchHandle<T>)> {
        if self.hub.closed.is_cancelled() {
            return Err(StorageError::Closed);
        }
        let scope = self.scope(key);
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (intake_tx, intake_rx) = mpsc::channel(self.hub.capacity);
        let (out, handle) = WatchHandle::channel(self.hub.capacity);
        let sub = Arc::new(Subscriber { id, tx: intake_tx, cancel: out.cancel_token(), dropped: AtomicU64::new(0) });
        self.hub.register(sub);
        tokio::spawn(run_subscriber(
            Arc::clone(&self.hub),
            Arc::clone(&self.store),
            id,
            intake_rx,
            out,
            scope,
            selector.clone(),
        ));
        info!(cacher = %self.hub.name, subscriber = id, key = %key, selector = %selector, "cacher: watch start");
        Ok((id, handle))
    }

    /// Like [`Storage::watch`] but also returns the subscriber id.
    pub fn watch_with_id(&self, key: &str, selector: &Selector) -> StorageResult<(u64, WatchHandle<T>)> { self.subscribe(key, selector) }
}

#[async_trait::async_trait]
impl<T: Object> Storage<T> for Cacher<T> {
    async fn create(&self, key: &str, obj: &T, ttl_secs: u64) -> StorageResult<Option<T>> { self.backend.create(key, obj, ttl_secs).await }

    async fn delete(&self, key: &str) -> StorageResult<Option<T>> { self.backend.delete(key).await }

    async fn get(&self, key: &str, ignore_not_found: bool) -> StorageResult<Option<T>> {
        match self.scope(key).and_then(|k| self.store.get_by_key(&k)) {
            Some(obj) => Ok(Some(obj)),
            None if ignore_not_found => Ok(None),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn list(&self, key: &str, selector: &Selector) -> StorageResult<Vec<T>> {
        let Some(prefix) = self.scope(key) else { return Ok(Vec::new()) };
        let mut out: Vec<(String, T)> = self
            .store
            .list()
            .into_iter()
            .filter_map(|o| self.store.key_of(&o).ok().map(|k| (k, o)))
            .filter(|(k, o)| key_matches(k, &prefix) && selector.matches_object(o))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, o)| o).collect())
    }

    async fn watch(&self, key: &str, selector: &Selector) -> StorageResult<WatchHandle<T>> { self.subscribe(key, selector).map(|(_, h)| h) }

    async fn close(&self) {
        if self.hub.closed.is_cancelled() {
            return;
        }
        self.hub.closed.cancel();
        let subs = self.hub.subs.swap(Arc::new(Vec::new()));
        for s in subs.iter() {
            s.cancel.cancel();
        }
        self.reflector.stop().await;
        info!(cacher = %self.hub.name, subscribers = subs.len(), "cacher: closed");
    }
}
