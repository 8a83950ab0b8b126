//! Kestrel reflector: keeps a local indexed store in sync with one backend query.
//!
//! A reflector runs a single task that lists everything once, opens a watch, and then
//! multiplexes watch events, a periodic full resync and a watch-health tick. All store
//! mutations and handler callbacks therefore happen sequentially on that task.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kestrel_api::{EventHandler, ListWatch, NoopHandler, StorageResult, WatchHandle};
use kestrel_core::{Event, Object, Settings};
use kestrel_store::Indexer;
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_WATCH_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of one full list reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

pub struct Reflector<T: Object> {
    name: String,
    lw: ListWatch<T>,
    store: Arc<Indexer<T>>,
    handler: Arc<dyn EventHandler<T>>,
    resync_period: Duration,
    watch_health_interval: Duration,
    under_watch: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct ReflectorBuilder<T: Object> {
    name: String,
    lw: ListWatch<T>,
    store: Arc<Indexer<T>>,
    handler: Arc<dyn EventHandler<T>>,
    resync_period: Duration,
    watch_health_interval: Duration,
}

impl<T: Object> ReflectorBuilder<T> {
    pub fn resync_period(mut self, d: Duration) -> Self {
        self.resync_period = d;
        self
    }

    pub fn watch_health_interval(mut self, d: Duration) -> Self {
        self.watch_health_interval = d;
        self
    }

    pub fn handler(mut self, h: Arc<dyn EventHandler<T>>) -> Self {
        self.handler = h;
        self
    }

    /// Take both periods from environment settings.
    pub fn settings(self, s: &Settings) -> Self { self.resync_period(s.resync_period()).watch_health_interval(s.watch_health_interval()) }

    pub fn build(self) -> Arc<Reflector<T>> {
        Arc::new(Reflector {
            name: self.name,
            lw: self.lw,
            store: self.store,
            handler: self.handler,
            resync_period: self.resync_period,
            watch_health_interval: self.watch_health_interval,
            under_watch: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }
}

async fn next_event<T>(watch: &mut Option<WatchHandle<T>>) -> Option<Event<T>> {
    match watch {
        Some(w) => w.recv().await,
        None => std::future::pending().await,
    }
}

impl<T: Object> Reflector<T> {
    pub fn builder(name: &str, lw: ListWatch<T>, store: Arc<Indexer<T>>) -> ReflectorBuilder<T> {
        ReflectorBuilder {
            name: name.to_string(),
            lw,
            store,
            handler: Arc::new(NoopHandler),
            resync_period: DEFAULT_RESYNC_PERIOD,
            watch_health_interval: DEFAULT_WATCH_HEALTH_INTERVAL,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn store(&self) -> &Arc<Indexer<T>> { &self.store }
    pub fn list_watch(&self) -> &ListWatch<T> { &self.lw }

    /// Whether a backend watch is currently open.
    pub fn is_watching(&self) -> bool { self.under_watch.load(Ordering::SeqCst) }

    pub fn is_stopped(&self) -> bool { self.cancel.is_cancelled() }

    /// Spawn the reflector task. Calling it again while running is a no-op.
    pub fn run(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        info!(reflector = %self.name, key = %self.lw.key(), "reflector: run");
        *task = Some(tokio::spawn(Arc::clone(self).run_loop()));
    }

    /// Cancel the task and wait for it to exit. No resync or watch restart happens afterwards.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(t) = task {
            let _ = t.await;
        }
        self.under_watch.store(false, Ordering::SeqCst);
        info!(reflector = %self.name, "reflector: stopped");
    }

    /// Drive `fut` unless the reflector is stopped first; `None` means stopped.
    async fn until_stopped<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    async fn run_loop(self: Arc<Self>) {
        // handler callbacks may block (a full queue, a slow subscriber), so each step races `stop`
        match self.until_stopped(self.list_all_data()).await {
            Some(Err(e)) => warn!(reflector = %self.name, error = %e, "reflector: initial list failed"),
            Some(Ok(_)) => {}
            None => return self.exit(None),
        }
        let Some(mut watch) = self.until_stopped(self.open_watch()).await else { return self.exit(None) };
        let now = tokio::time::Instant::now();
        let mut resync = interval_at(now + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval_at(now + self.watch_health_interval, self.watch_health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                ev = next_event(&mut watch) => match ev {
                    Some(ev) => {
                        if self.until_stopped(self.handle_event(ev)).await.is_none() { break; }
                    }
                    None => {
                        warn!(reflector = %self.name, "reflector: watch closed");
                        watch = None;
                        self.under_watch.store(false, Ordering::SeqCst);
                    }
                },
                _ = resync.tick() => match self.until_stopped(self.list_all_data()).await {
                    Some(Err(e)) => warn!(reflector = %self.name, error = %e, "reflector: resync failed; keeping cache"),
                    Some(Ok(_)) => {}
                    None => break,
                },
                _ = health.tick() => {
                    if watch.is_none() {
                        counter!("reflector_watch_restarts_total", 1, "reflector" => self.name.clone());
                        match self.until_stopped(self.open_watch()).await {
                            Some(w) => watch = w,
                            None => break,
                        }
                    }
                }
            }
        }
        self.exit(watch);
    }

    fn exit(&self, watch: Option<WatchHandle<T>>) {
        if let Some(w) = watch {
            w.stop();
        }
        self.under_watch.store(false, Ordering::SeqCst);
        debug!(reflector = %self.name, "reflector: loop exited");
    }

    async fn open_watch(&self) -> Option<WatchHandle<T>> {
        match self.lw.watch().await {
            Ok(w) => {
                self.under_watch.store(true, Ordering::SeqCst);
                info!(reflector = %self.name, key = %self.lw.key(), "reflector: watch open");
                Some(w)
            }
            Err(e) => {
                self.under_watch.store(false, Ordering::SeqCst);
                warn!(reflector = %self.name, error = %e, "reflector: watch open failed");
                None
            }
        }
    }

    async fn handle_event(&self, ev: Event<T>) {
        counter!("reflector_events_total", 1, "reflector" => self.name.clone(), "type" => ev.kind().as_wire());
        match ev {
            Event::Added(obj) | Event::Updated(obj) | Event::Sync(obj) => self.upsert(obj).await,
            Event::Deleted(obj) => {
                let key = match self.store.key_of(&obj) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(reflector = %self.name, error = %e, "reflector: deleted object has no key");
                        return;
                    }
                };
                // a delete for an unknown key was already reported, or never added
                if let Some(old) = self.store.delete_key(&key) {
                    self.handler.on_delete(&old).await;
                }
            }
            Event::Error(msg) => warn!(reflector = %self.name, error = %msg, "reflector: error event"),
        }
    }

    async fn upsert(&self, obj: T) {
        match self.store.add(obj.clone()) {
            Ok(Some(old)) => self.handler.on_update(&old, &obj).await,
            Ok(None) => self.handler.on_add(&obj).await,
            Err(e) => warn!(reflector = %self.name, error = %e, "reflector: object has no key; skipping"),
        }
    }

    /// Full list reconciliation against the local store.
    ///
    /// New keys are added, changed values replace the cached ones, identical values
    /// produce no callback, and keys missing from the fresh list are removed with an
    /// `on_delete` carrying the cached value. A failed list leaves the store untouched.
    pub async fn list_all_data(&self) -> StorageResult<ResyncStats> {
        let started = Instant::now();
        counter!("reflector_list_total", 1, "reflector" => self.name.clone());
        let items = match self.lw.list().await {
            Ok(items) => items,
            Err(e) => {
                counter!("reflector_list_errors_total", 1, "reflector" => self.name.clone());
                return Err(e);
            }
        };
        let mut stats = ResyncStats::default();
        let mut fresh: FxHashSet<String> = FxHashSet::default();
        for obj in items {
            let key = match self.store.key_of(&obj) {
                Ok(k) => k,
                Err(e) => {
                    warn!(reflector = %self.name, error = %e, "reflector: listed object has no key; skipping");
                    continue;
                }
            };
            fresh.insert(key.clone());
            match self.store.get_by_key(&key) {
                None => {
                    self.upsert(obj).await;
                    stats.added += 1;
                }
                Some(old) if old != obj => {
                    self.upsert(obj).await;
                    stats.updated += 1;
                }
                Some(_) => {}
            }
        }
        for key in self.store.list_keys() {
            if fresh.contains(&key) {
                continue;
            }
            if let Some(old) = self.store.delete_key(&key) {
                self.handler.on_delete(&old).await;
                stats.deleted += 1;
            }
        }
        histogram!("reflector_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            reflector = %self.name,
            added = stats.added,
            updated = stats.updated,
            deleted = stats.deleted,
            size = self.store.len(),
            "reflector: resync ok"
        );
        Ok(stats)
    }
}
