//! Recursive subtree watcher over single-node watches.
//!
//! Each live path gets one task. The task multiplexes a self-loop (existence and data of
//! the node) and, for containment layers, a children-loop that spawns a task per new
//! child at the next layer and tears down vanished ones. Nodes are kept in an arena keyed
//! by absolute path; a node's cancellation token is a child of its parent's, so stopping
//! any node cascades to its subtree. Teardown joins descendant tasks before deletions are
//! announced, and each data node announces its deletion at most once.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use kestrel_api::WatchSender;
use kestrel_core::{Codec, Event, Layout, Object, Selector, Settings};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{Layer, NodeEvent, TreeClient, TreeError};
use crate::deleted_from_path;

#[derive(Debug, Clone, Copy)]
pub struct TreeWatchConfig {
    /// Period of the tick that restarts a node's dead self- or children-loop.
    pub supervise_interval: Duration,
    /// Period of the forced re-read of data nodes, dispatched as `Sync`.
    pub force_sync_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for TreeWatchConfig {
    fn default() -> Self {
        Self { supervise_interval: Duration::from_secs(3), force_sync_interval: Duration::from_secs(300), channel_capacity: 128 }
    }
}

impl From<&Settings> for TreeWatchConfig {
    fn from(s: &Settings) -> Self {
        Self {
            supervise_interval: s.tree_supervise_interval(),
            force_sync_interval: s.tree_force_sync_interval(),
            channel_capacity: s.queue_cap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelfExit {
    /// The node no longer exists.
    Gone,
    /// The watch was lost or the service failed; retry on the next supervise tick.
    Ended,
}

struct NodeSlot {
    layer: usize,
    parent: Option<String>,
    children: BTreeSet<String>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    announced: Arc<AtomicBool>,
}

struct Shared<T: Object> {
    client: Arc<dyn TreeClient>,
    codec: Arc<dyn Codec<T>>,
    layers: Vec<Layer>,
    layout: Layout,
    selector: Selector,
    sink: WatchSender<T>,
    cfg: TreeWatchConfig,
    tracker: TaskTracker,
    nodes: Mutex<FxHashMap<String, NodeSlot>>,
}

/// Handle on a running subtree watch.
pub struct TreeWatcher<T: Object> {
    shared: Arc<Shared<T>>,
    root: String,
}

impl<T: Object> TreeWatcher<T> {
    /// Start watching the subtree rooted at the absolute path `root`; events go to `sink`.
    pub fn start(
        client: Arc<dyn TreeClient>,
        codec: Arc<dyn Codec<T>>,
        root: &str,
        layers: Vec<Layer>,
        layout: Layout,
        selector: Selector,
        sink: WatchSender<T>,
        cfg: TreeWatchConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            client,
            codec,
            layers,
            layout,
            selector,
            sink,
            cfg,
            tracker: TaskTracker::new(),
            nodes: Mutex::new(FxHashMap::default()),
        });
        if let Some(layer) = shared.layers.first().copied() {
            shared.spawn_node(root.to_string(), layer, None);
        }
        debug!(root = %root, layers = shared.layers.len(), "tree: watch start");
        Self { shared, root: root.to_string() }
    }

    /// Cancel every node and wait for all node tasks to finish. Idempotent.
    pub async fn stop(&self) {
        let root_cancel = self.shared.lock().get(&self.root).map(|s| s.cancel.clone());
        if let Some(c) = root_cancel {
            c.cancel();
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.lock().clear();
        debug!(root = %self.root, "tree: watch stopped");
    }

    pub fn is_stopped(&self) -> bool { self.shared.tracker.is_closed() && self.shared.tracker.is_empty() }

    /// Number of live node watchers.
    pub fn node_count(&self) -> usize { self.shared.lock().len() }

    /// Paths of live node watchers, sorted.
    pub fn watched_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = self.shared.lock().keys().cloned().collect();
        out.sort();
        out
    }
}

async fn poll_opt<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(f) => f.await,
        None => std::future::pending().await,
    }
}

impl<T: Object> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, NodeSlot>> { self.nodes.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Register and start a node under `parent`. Returns false when the node is already
    /// tracked or the parent is being torn down.
    fn spawn_node(self: &Arc<Self>, path: String, layer: Layer, parent: Option<&str>) -> bool {
        let mut nodes = self.lock();
        if nodes.contains_key(&path) {
            return false;
        }
        let cancel = match parent {
            Some(p) => match nodes.get_mut(p) {
                Some(slot) if !slot.cancel.is_cancelled() => {
                    slot.children.insert(path.clone());
                    slot.cancel.child_token()
                }
                _ => return false,
            },
            None => self.sink.cancel_token().child_token(),
        };
        let announced = Arc::new(AtomicBool::new(false));
        let handle = self.tracker.spawn(Arc::clone(self).run_node(path.clone(), layer, cancel.clone(), Arc::clone(&announced)));
        nodes.insert(
            path,
            NodeSlot {
                layer: layer.index,
                parent: parent.map(|p| p.to_string()),
                children: BTreeSet::new(),
                cancel,
                handle: Some(handle),
                announced,
            },
        );
        true
    }

    async fn run_node(self: Arc<Self>, path: String, layer: Layer, cancel: CancellationToken, announced: Arc<AtomicBool>) {
        let is_root = layer.index == 0;
        let sup = self.cfg.supervise_interval;
        let mut supervise = interval_at(Instant::now() + sup, sup);
        supervise.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let force = self.cfg.force_sync_interval;
        let mut force_sync = interval_at(Instant::now() + force, force);
        force_sync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut self_fut: Option<BoxFuture<'_, SelfExit>> = Some(self.self_loop(&path, layer, &announced).boxed());
        let mut kids_fut: Option<BoxFuture<'_, ()>> = layer.watch_children.then(|| self.children_loop(&path, layer).boxed());
        debug!(path = %path, layer = layer.name, "tree: node start");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                exit = poll_opt(&mut self_fut) => {
                    self_fut = None;
                    if exit == SelfExit::Gone {
                        if !is_root {
                            self.forget(&path, true).await;
                            break;
                        }
                        self.root_gone(&path, &announced).await;
                        self_fut = Some(self.await_root(&path, layer, &announced).boxed());
                    }
                }
                _ = poll_opt(&mut kids_fut) => { kids_fut = None; }
                _ = supervise.tick() => {
                    if self_fut.is_none() {
                        counter!("tree_loop_restarts_total", 1, "loop" => "self");
                        self_fut = Some(self.self_loop(&path, layer, &announced).boxed());
                    }
                    if layer.watch_children && kids_fut.is_none() {
                        counter!("tree_loop_restarts_total", 1, "loop" => "children");
                        kids_fut = Some(self.children_loop(&path, layer).boxed());
                    }
                }
                _ = force_sync.tick(), if layer.is_data => { self.force_sync(&path, &announced).await; }
            }
        }
        debug!(path = %path, "tree: node exit");
    }

    /// Existence and data watch of one node. Data layers dispatch every snapshot.
    async fn self_loop(&self, path: &str, layer: Layer, announced: &AtomicBool) -> SelfExit {
        loop {
            let (data, watch) = match self.client.get_w(path).await {
                Ok(Some(found)) => found,
                Ok(None) | Err(TreeError::NoNode(_)) => return SelfExit::Gone,
                Err(e) => {
                    warn!(path = %path, error = %e, "tree: get failed");
                    return SelfExit::Ended;
                }
            };
            if layer.is_data {
                self.dispatch(path, &data, false, announced).await;
            }
            match watch.await {
                Ok(NodeEvent::Deleted) => return SelfExit::Gone,
                Ok(_) => continue,
                Err(_) => {
                    debug!(path = %path, "tree: node watch lost");
                    return SelfExit::Ended;
                }
            }
        }
    }

    /// Wait for a vanished root to be created again, then resume its self-loop.
    async fn await_root(&self, path: &str, layer: Layer, announced: &AtomicBool) -> SelfExit {
        match self.client.exists_w(path).await {
            Ok((true, _)) => {}
            Ok((false, watch)) => {
                if watch.await.is_err() {
                    debug!(path = %path, "tree: existence watch lost");
                    return SelfExit::Ended;
                }
                debug!(path = %path, "tree: root recreated");
            }
            Err(e) => {
                warn!(path = %path, error = %e, "tree: exists failed");
                return SelfExit::Ended;
            }
        }
        self.self_loop(path, layer, announced).await
    }

    /// Membership watch of one containment node.
    async fn children_loop(self: &Arc<Self>, path: &str, layer: Layer) {
        let Some(child_layer) = self.layers.get(layer.index + 1).copied() else { return };
        loop {
            let (names, watch) = match self.client.children_w(path).await {
                Ok(found) => found,
                Err(TreeError::NoNode(_)) => return,
                Err(e) => {
                    warn!(path = %path, error = %e, "tree: children failed");
                    return;
                }
            };
            self.sync_children(path, child_layer, names).await;
            match watch.await {
                Ok(NodeEvent::ChildrenChanged) => continue,
                Ok(_) => return,
                Err(_) => {
                    debug!(path = %path, "tree: children watch lost");
                    return;
                }
            }
        }
    }

    async fn sync_children(self: &Arc<Self>, path: &str, child_layer: Layer, names: Vec<String>) {
        let wanted: BTreeSet<String> = names.iter().map(|n| child_path(path, n)).collect();
        let current = self.lock().get(path).map(|s| s.children.clone()).unwrap_or_default();
        for gone in current.difference(&wanted) {
            self.forget(gone, false).await;
        }
        for added in wanted.difference(&current) {
            if self.spawn_node(added.clone(), child_layer, Some(path)) {
                counter!("tree_nodes_started_total", 1);
            }
        }
    }

    async fn dispatch(&self, path: &str, data: &[u8], sync: bool, announced: &AtomicBool) {
        if data.is_empty() {
            return;
        }
        let obj = match self.codec.decode(data) {
            Ok(obj) => obj,
            Err(e) => {
                warn!(path = %path, error = %e, "tree: decode failed; skipping");
                return;
            }
        };
        if self.selector.matches_object(&obj) {
            announced.store(true, Ordering::SeqCst);
            self.sink.send(if sync { Event::Sync(obj) } else { Event::Updated(obj) }).await;
        } else if announced.swap(false, Ordering::SeqCst) {
            // the object moved out of the selector
            self.sink.send(Event::Deleted(obj)).await;
        }
    }

    async fn force_sync(&self, path: &str, announced: &AtomicBool) {
        match self.client.get(path).await {
            Ok(Some(data)) => self.dispatch(path, &data, true, announced).await,
            Ok(None) => {}
            Err(e) => warn!(path = %path, error = %e, "tree: force sync failed"),
        }
    }

    async fn announce_deleted(&self, path: &str, announced: &AtomicBool) {
        if !announced.swap(false, Ordering::SeqCst) {
            return;
        }
        let obj: T = deleted_from_path(path, self.layout);
        if self.selector.matches_identity(obj.meta()) {
            self.sink.send(Event::Deleted(obj)).await;
        }
    }

    /// The root vanished: tear down everything below it and announce its own deletion.
    async fn root_gone(&self, path: &str, announced: &AtomicBool) {
        let kids = self.lock().get(path).map(|s| s.children.clone()).unwrap_or_default();
        for kid in kids {
            self.forget(&kid, false).await;
        }
        self.announce_deleted(path, announced).await;
    }

    /// Remove `path` and its subtree from the arena, cancel and join their tasks, then
    /// announce deletion of every announced data node. With `own`, the caller is the
    /// node's own task and its handle is not joined.
    async fn forget(&self, path: &str, own: bool) {
        let removed = {
            let mut nodes = self.lock();
            if let Some(parent) = nodes.get(path).and_then(|s| s.parent.clone()) {
                if let Some(slot) = nodes.get_mut(&parent) {
                    slot.children.remove(path);
                }
            }
            let mut stack = vec![path.to_string()];
            let mut removed = Vec::new();
            while let Some(p) = stack.pop() {
                if let Some(slot) = nodes.remove(&p) {
                    stack.extend(slot.children.iter().cloned());
                    removed.push((p, slot));
                }
            }
            removed
        };
        if removed.is_empty() {
            return;
        }
        for (_, slot) in &removed {
            slot.cancel.cancel();
        }
        let mut announce = Vec::with_capacity(removed.len());
        for (p, mut slot) in removed {
            if let Some(handle) = slot.handle.take() {
                if !(own && p == path) {
                    let _ = handle.await;
                }
            }
            if self.layers.get(slot.layer).map(|l| l.is_data).unwrap_or(false) {
                announce.push((p, slot.announced));
            }
        }
        for (p, announced) in announce {
            self.announce_deleted(&p, &announced).await;
        }
        debug!(path = %path, "tree: subtree forgotten");
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" { format!("/{name}") } else { format!("{parent}/{name}") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{layers_for, MemTree};
    use kestrel_api::WatchHandle;
    use kestrel_core::{JsonCodec, RawObject};

    fn cfg() -> TreeWatchConfig {
        TreeWatchConfig { supervise_interval: Duration::from_millis(50), force_sync_interval: Duration::from_secs(300), channel_capacity: 64 }
    }

    fn start(tree: &MemTree, root: &str, key: &str) -> (TreeWatcher<RawObject>, WatchHandle<RawObject>) {
        start_with(tree, root, key, cfg())
    }

    fn start_with(tree: &MemTree, root: &str, key: &str, cfg: TreeWatchConfig) -> (TreeWatcher<RawObject>, WatchHandle<RawObject>) {
        let (tx, rx) = WatchHandle::channel(64);
        let w = TreeWatcher::start(
            Arc::new(tree.clone()),
            Arc::new(JsonCodec::<RawObject>::new()),
            root,
            layers_for(key, Layout::Namespaced).unwrap(),
            Layout::Namespaced,
            Selector::everything(),
            tx,
            cfg,
        );
        (w, rx)
    }

    async fn next(rx: &mut WatchHandle<RawObject>) -> Event<RawObject> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("timeout").expect("closed")
    }

    #[tokio::test]
    async fn forget_joins_subtree_and_announces_once() {
        let tree = MemTree::new();
        tree.create("/k/apps/ns1/a", br#"{"name":"a","namespace":"ns1"}"#, None).await.unwrap();
        let (w, mut rx) = start(&tree, "/k/apps", "apps");
        assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.name() == "a"));
        assert_eq!(w.watched_paths(), vec!["/k/apps", "/k/apps/ns1", "/k/apps/ns1/a"]);

        tree.delete_recursive("/k/apps/ns1").unwrap();
        match next(&mut rx).await {
            Event::Deleted(o) => assert_eq!(o.identity(), (Some("ns1"), "a")),
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_none(), "deletion must be announced once");
        assert_eq!(w.watched_paths(), vec!["/k/apps"]);

        w.stop().await;
        assert!(w.is_stopped());
        assert_eq!(w.node_count(), 0);
    }

    #[tokio::test]
    async fn data_nodes_are_resent_as_sync() {
        let tree = MemTree::new();
        tree.create("/k/apps/ns1/a", br#"{"name":"a","namespace":"ns1"}"#, None).await.unwrap();
        let cfg = TreeWatchConfig { force_sync_interval: Duration::from_millis(100), ..cfg() };
        let (w, mut rx) = start_with(&tree, "/k/apps", "apps", cfg);
        assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.name() == "a"));
        assert!(matches!(next(&mut rx).await, Event::Sync(o) if o.name() == "a"));
        assert!(matches!(next(&mut rx).await, Event::Sync(o) if o.name() == "a"));
        w.stop().await;
    }

    #[tokio::test]
    async fn root_deletion_is_reported_and_recreation_resumes() {
        let tree = MemTree::new();
        tree.create("/k/apps/ns1/a", br#"{"name":"a","namespace":"ns1"}"#, None).await.unwrap();
        let (w, mut rx) = start(&tree, "/k/apps/ns1", "apps/ns1");
        assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.name() == "a"));

        tree.delete_recursive("/k/apps/ns1").unwrap();
        match next(&mut rx).await {
            Event::Deleted(o) => assert_eq!(o.identity(), (Some("ns1"), "a")),
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_none());
        assert_eq!(w.watched_paths(), vec!["/k/apps/ns1"]);

        tree.create("/k/apps/ns1/b", br#"{"name":"b","namespace":"ns1"}"#, None).await.unwrap();
        assert!(matches!(next(&mut rx).await, Event::Updated(o) if o.name() == "b"));
        assert_eq!(w.watched_paths(), vec!["/k/apps/ns1", "/k/apps/ns1/b"]);
        w.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tree = MemTree::new();
        tree.create("/k/apps", b"", None).await.unwrap();
        let (w, _rx) = start(&tree, "/k/apps", "apps");
        w.stop().await;
        w.stop().await;
        assert!(w.is_stopped());
    }

    #[test]
    fn child_paths() {
        assert_eq!(child_path("/", "k"), "/k");
        assert_eq!(child_path("/k", "apps"), "/k/apps");
    }
}
