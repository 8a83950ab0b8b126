use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kestrel_api::{Storage, StorageError, StorageResult, WatchHandle};
use kestrel_core::{join_key, validate_key, Codec, Layout, Object, Selector};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{layers_for, TreeClient, TreeError, TreeWatchConfig, TreeWatcher};

/// `Storage` over a coordination tree rooted at `prefix`.
pub struct TreeStorage<T: Object> {
    client: Arc<dyn TreeClient>,
    codec: Arc<dyn Codec<T>>,
    prefix: String,
    layout: Layout,
    cfg: TreeWatchConfig,
    watches: Mutex<Vec<CancellationToken>>,
}

impl<T: Object> TreeStorage<T> {
    pub fn new(client: Arc<dyn TreeClient>, codec: Arc<dyn Codec<T>>, prefix: &str, layout: Layout) -> Self {
        Self { client, codec, prefix: prefix.to_string(), layout, cfg: TreeWatchConfig::default(), watches: Mutex::new(Vec::new()) }
    }

    pub fn with_config(mut self, cfg: TreeWatchConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn layout(&self) -> Layout { self.layout }

    fn path(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(join_key(&self.prefix, key))
    }

    /// Depth-first walk collecting every payload-bearing node at or below `path`.
    async fn walk(&self, path: &str, out: &mut Vec<(String, Vec<u8>)>) -> StorageResult<()> {
        let mut stack = vec![path.to_string()];
        while let Some(p) = stack.pop() {
            match self.client.get(&p).await? {
                Some(data) if !data.is_empty() => out.push((p.clone(), data)),
                Some(_) => {}
                None => continue,
            }
            match self.client.children(&p).await {
                Ok(kids) => {
                    for k in kids.iter().rev() {
                        stack.push(if p == "/" { format!("/{k}") } else { format!("{p}/{k}") });
                    }
                }
                // raced with a delete
                Err(TreeError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Object> Storage<T> for TreeStorage<T> {
    async fn create(&self, key: &str, obj: &T, ttl_secs: u64) -> StorageResult<Option<T>> {
        let path = self.path(key)?;
        let data = self.codec.encode(obj)?;
        let prev = match self.client.get(&path).await? {
            Some(raw) if !raw.is_empty() => self.codec.decode(&raw).ok(),
            _ => None,
        };
        if self.client.exists(&path).await? {
            // a node's TTL is fixed at creation
            if ttl_secs > 0 {
                debug!(path = %path, ttl_secs, "tree: replace keeps the node's original ttl");
            }
            self.client.set(&path, &data).await?;
        } else {
            let ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs));
            self.client.create(&path, &data, ttl).await?;
        }
        info!(path = %path, replaced = prev.is_some(), "tree: create ok");
        Ok(prev)
    }

    async fn delete(&self, key: &str) -> StorageResult<Option<T>> {
        let path = self.path(key)?;
        let prev = match self.client.get(&path).await? {
            Some(raw) if !raw.is_empty() => self.codec.decode(&raw).ok(),
            Some(_) => None,
            None => return Err(StorageError::NotFound(path)),
        };
        self.client.delete(&path).await?;
        info!(path = %path, "tree: delete ok");
        Ok(prev)
    }

    async fn get(&self, key: &str, ignore_not_found: bool) -> StorageResult<Option<T>> {
        let path = self.path(key)?;
        match self.client.get(&path).await? {
            Some(raw) if !raw.is_empty() => Ok(Some(self.codec.decode(&raw)?)),
            _ if ignore_not_found => Ok(None),
            _ => Err(StorageError::NotFound(path)),
        }
    }

    async fn list(&self, key: &str, selector: &Selector) -> StorageResult<Vec<T>> {
        let path = self.path(key)?;
        let mut raw = Vec::new();
        self.walk(&path, &mut raw).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (p, data) in raw {
            match self.codec.decode(&data) {
                Ok(obj) if selector.matches_object(&obj) => out.push(obj),
                Ok(_) => {}
                Err(e) => {
                    counter!("backend_decode_errors_total", 1, "backend" => "tree");
                    warn!(path = %p, error = %e, "tree: decode failed; skipping");
                }
            }
        }
        debug!(path = %path, items = out.len(), "tree: list ok");
        Ok(out)
    }

    async fn watch(&self, key: &str, selector: &Selector) -> StorageResult<WatchHandle<T>> {
        let path = self.path(key)?;
        let layers = layers_for(key, self.layout)?;
        let (tx, handle) = WatchHandle::channel(self.cfg.channel_capacity);
        let token = handle.cancel_token();
        let watcher = TreeWatcher::start(
            Arc::clone(&self.client),
            Arc::clone(&self.codec),
            &path,
            layers,
            self.layout,
            selector.clone(),
            tx,
            self.cfg,
        );
        {
            let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            watches.retain(|t| !t.is_cancelled());
            watches.push(token.clone());
        }
        tokio::spawn(async move {
            token.cancelled().await;
            watcher.stop().await;
        });
        info!(path = %path, selector = %selector, "tree: watch start");
        Ok(handle)
    }

    async fn close(&self) {
        let watches = std::mem::take(&mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner));
        for t in &watches {
            t.cancel();
        }
        info!(prefix = %self.prefix, watches = watches.len(), "tree: closed");
    }
}
