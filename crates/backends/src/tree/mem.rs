//! In-process coordination tree with one-shot watch semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use super::{NodeEvent, NodeWatch, TreeClient, TreeError, TreeResult};

#[derive(Default)]
struct Node {
    data: Vec<u8>,
    children: BTreeSet<String>,
    version: u64,
    /// Idle lifetime; every write restarts the countdown.
    ttl: Option<Duration>,
    data_watches: Vec<oneshot::Sender<NodeEvent>>,
    child_watches: Vec<oneshot::Sender<NodeEvent>>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    // registered on missing paths; fired on creation
    exist_watches: BTreeMap<String, Vec<oneshot::Sender<NodeEvent>>>,
}

/// Shared in-memory tree. Clones share state.
#[derive(Clone)]
pub struct MemTree {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemTree {
    fn default() -> Self { Self::new() }
}

fn fire(watches: &mut Vec<oneshot::Sender<NodeEvent>>, ev: NodeEvent) {
    for w in watches.drain(..) {
        let _ = w.send(ev);
    }
}

fn normalize(path: &str) -> TreeResult<String> {
    if !path.starts_with('/') {
        return Err(TreeError::BadPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    if trimmed.split('/').skip(1).any(|s| s.is_empty()) {
        return Err(TreeError::BadPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

fn parent_of(path: &str) -> Option<(&str, &str)> {
    if path == "/" { return None; }
    let (parent, name) = path.rsplit_once('/')?;
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

impl MemTree {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.nodes.insert("/".to_string(), Node::default());
        Self { inner: Arc::new(Mutex::new(inner)) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Remove `path` after `ttl` unless it was written again or gained children meanwhile.
    fn expire_after(&self, path: String, version: u64, ttl: Duration) {
        let me = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut inner = me.lock();
            let same = inner.nodes.get(&path).map(|n| n.version == version && n.children.is_empty()).unwrap_or(false);
            if same {
                debug!(path = %path, "ttl expired; removing node");
                let _ = Self::delete_locked(&mut inner, &path);
            }
        });
    }

    fn insert_locked(inner: &mut Inner, path: &str, data: Vec<u8>) {
        if let Some((parent, name)) = parent_of(path) {
            if let Some(p) = inner.nodes.get_mut(parent) {
                p.children.insert(name.to_string());
                fire(&mut p.child_watches, NodeEvent::ChildrenChanged);
            }
        }
        inner.nodes.insert(path.to_string(), Node { data, ..Default::default() });
        if let Some(mut ws) = inner.exist_watches.remove(path) {
            fire(&mut ws, NodeEvent::Created);
        }
    }

    fn delete_locked(inner: &mut Inner, path: &str) -> TreeResult<()> {
        let node = inner.nodes.get(path).ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(TreeError::NotEmpty(path.to_string()));
        }
        if path == "/" {
            return Err(TreeError::BadPath(path.to_string()));
        }
        if let Some(mut node) = inner.nodes.remove(path) {
            fire(&mut node.data_watches, NodeEvent::Deleted);
            fire(&mut node.child_watches, NodeEvent::Deleted);
        }
        if let Some((parent, name)) = parent_of(path) {
            if let Some(p) = inner.nodes.get_mut(parent) {
                p.children.remove(name);
                fire(&mut p.child_watches, NodeEvent::ChildrenChanged);
            }
        }
        Ok(())
    }

    /// Delete a node and everything below it, deepest first.
    pub fn delete_recursive(&self, path: &str) -> TreeResult<()> {
        let path = normalize(path)?;
        let mut inner = self.lock();
        if !inner.nodes.contains_key(&path) {
            return Err(TreeError::NoNode(path));
        }
        let below = format!("{}/", path.trim_end_matches('/'));
        let mut doomed: Vec<String> = inner.nodes.keys().filter(|k| k.starts_with(&below)).cloned().collect();
        doomed.sort_by_key(|k| std::cmp::Reverse(k.matches('/').count()));
        for p in doomed {
            Self::delete_locked(&mut inner, &p)?;
        }
        if path != "/" {
            Self::delete_locked(&mut inner, &path)?;
        }
        Ok(())
    }

    /// Drop every pending watch without firing it, as a lost session would.
    pub fn expire_watches(&self) {
        let mut inner = self.lock();
        for node in inner.nodes.values_mut() {
            node.data_watches.clear();
            node.child_watches.clear();
        }
        inner.exist_watches.clear();
    }

    /// Number of armed watches whose receiver is still alive.
    pub fn watch_count(&self) -> usize {
        let inner = self.lock();
        let live = |ws: &Vec<oneshot::Sender<NodeEvent>>| ws.iter().filter(|w| !w.is_closed()).count();
        inner.nodes.values().map(|n| live(&n.data_watches) + live(&n.child_watches)).sum::<usize>()
            + inner.exist_watches.values().map(live).sum::<usize>()
    }

}

#[async_trait::async_trait]
impl TreeClient for MemTree {
    async fn exists(&self, path: &str) -> TreeResult<bool> {
        let path = normalize(path)?;
        Ok(self.lock().nodes.contains_key(&path))
    }

    async fn exists_w(&self, path: &str) -> TreeResult<(bool, NodeWatch)> {
        let path = normalize(path)?;
        let mut inner = self.lock();
        let (tx, rx) = oneshot::channel();
        match inner.nodes.get_mut(&path) {
            Some(node) => {
                node.data_watches.push(tx);
                Ok((true, rx))
            }
            None => {
                inner.exist_watches.entry(path).or_default().push(tx);
                Ok((false, rx))
            }
        }
    }

    async fn get(&self, path: &str) -> TreeResult<Option<Vec<u8>>> {
        let path = normalize(path)?;
        Ok(self.lock().nodes.get(&path).map(|n| n.data.clone()))
    }

    async fn get_w(&self, path: &str) -> TreeResult<Option<(Vec<u8>, NodeWatch)>> {
        let path = normalize(path)?;
        let mut inner = self.lock();
        Ok(inner.nodes.get_mut(&path).map(|n| {
            let (tx, rx) = oneshot::channel();
            n.data_watches.push(tx);
            (n.data.clone(), rx)
        }))
    }

    async fn children(&self, path: &str) -> TreeResult<Vec<String>> {
        let path = normalize(path)?;
        let inner = self.lock();
        let node = inner.nodes.get(&path).ok_or(TreeError::NoNode(path.clone()))?;
        Ok(node.children.iter().cloned().collect())
    }

    async fn children_w(&self, path: &str) -> TreeResult<(Vec<String>, NodeWatch)> {
        let path = normalize(path)?;
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&path).ok_or(TreeError::NoNode(path.clone()))?;
        let (tx, rx) = oneshot::channel();
        node.child_watches.push(tx);
        Ok((node.children.iter().cloned().collect(), rx))
    }

    async fn create(&self, path: &str, data: &[u8], ttl: Option<Duration>) -> TreeResult<()> {
        let path = normalize(path)?;
        let version = {
            let mut inner = self.lock();
            if inner.nodes.contains_key(&path) {
                return Err(TreeError::NodeExists(path));
            }
            let mut missing = Vec::new();
            let mut cur = path.as_str();
            while let Some((parent, _)) = parent_of(cur) {
                if inner.nodes.contains_key(parent) { break; }
                missing.push(parent.to_string());
                cur = parent;
            }
            for p in missing.iter().rev() {
                Self::insert_locked(&mut inner, p, Vec::new());
            }
            Self::insert_locked(&mut inner, &path, data.to_vec());
            match inner.nodes.get_mut(&path) {
                Some(n) => {
                    n.ttl = ttl;
                    n.version
                }
                None => 0,
            }
        };
        if let Some(ttl) = ttl {
            self.expire_after(path, version, ttl);
        }
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> TreeResult<()> {
        let path = normalize(path)?;
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&path).ok_or(TreeError::NoNode(path.clone()))?;
        node.data = data.to_vec();
        node.version += 1;
        fire(&mut node.data_watches, NodeEvent::DataChanged);
        let renew = node.ttl.map(|ttl| (node.version, ttl));
        drop(inner);
        if let Some((version, ttl)) = renew {
            self.expire_after(path, version, ttl);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> TreeResult<()> {
        let path = normalize(path)?;
        let mut inner = self.lock();
        Self::delete_locked(&mut inner, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_makes_parents_and_fires_children_watch() {
        let t = MemTree::new();
        t.create("/k/apps", b"", None).await.unwrap();
        let (kids, w) = t.children_w("/k/apps").await.unwrap();
        assert!(kids.is_empty());
        t.create("/k/apps/ns1/a", b"{}", None).await.unwrap();
        assert_eq!(w.await.unwrap(), NodeEvent::ChildrenChanged);
        assert_eq!(t.children("/k/apps").await.unwrap(), vec!["ns1".to_string()]);
        assert_eq!(t.get("/k/apps/ns1").await.unwrap(), Some(Vec::new()));
        assert_eq!(t.create("/k/apps/ns1/a", b"", None).await, Err(TreeError::NodeExists("/k/apps/ns1/a".into())));
    }

    #[tokio::test]
    async fn data_watch_is_one_shot() {
        let t = MemTree::new();
        t.create("/a", b"1", None).await.unwrap();
        let (_, w) = t.get_w("/a").await.unwrap().unwrap();
        t.set("/a", b"2").await.unwrap();
        assert_eq!(w.await.unwrap(), NodeEvent::DataChanged);
        let (d, w) = t.get_w("/a").await.unwrap().unwrap();
        assert_eq!(d, b"2".to_vec());
        t.delete("/a").await.unwrap();
        assert_eq!(w.await.unwrap(), NodeEvent::Deleted);
        assert!(t.get_w("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_refuses_non_empty_and_recursive_works() {
        let t = MemTree::new();
        t.create("/a/b/c", b"x", None).await.unwrap();
        assert_eq!(t.delete("/a/b").await, Err(TreeError::NotEmpty("/a/b".into())));
        t.delete_recursive("/a").unwrap();
        assert!(!t.exists("/a").await.unwrap());
        assert!(t.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn expired_watches_see_dropped_sender() {
        let t = MemTree::new();
        t.create("/a", b"1", None).await.unwrap();
        let (_, w) = t.get_w("/a").await.unwrap().unwrap();
        assert_eq!(t.watch_count(), 1);
        t.expire_watches();
        assert!(w.await.is_err());
        assert_eq!(t.watch_count(), 0);
    }

    #[tokio::test]
    async fn exists_watch_fires_on_create() {
        let t = MemTree::new();
        let (present, w) = t.exists_w("/later").await.unwrap();
        assert!(!present);
        t.create("/later", b"", None).await.unwrap();
        assert_eq!(w.await.unwrap(), NodeEvent::Created);
    }

    #[tokio::test]
    async fn ttl_removes_node() {
        let t = MemTree::new();
        t.create("/tmp/x", b"1", Some(Duration::from_millis(30))).await.unwrap();
        assert!(t.exists("/tmp/x").await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!t.exists("/tmp/x").await.unwrap());
        assert!(t.exists("/tmp").await.unwrap());
    }

    #[tokio::test]
    async fn writes_restart_the_ttl() {
        let t = MemTree::new();
        t.create("/x", b"1", Some(Duration::from_millis(100))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        t.set("/x", b"2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(t.exists("/x").await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!t.exists("/x").await.unwrap());
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(normalize("a/b").is_err());
        assert!(normalize("/a//b").is_err());
        assert_eq!(normalize("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
    }
}
