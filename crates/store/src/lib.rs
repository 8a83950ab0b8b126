//! Kestrel store: the local indexed mirror owned by a reflector, and the event queue.

#![forbid(unsafe_code)]

use std::sync::{RwLock, PoisonError};

use kestrel_core::{CoreError, CoreResult, Object, ObjectKeyFunc};
use rustc_hash::{FxHashMap, FxHashSet};

pub mod queue;

pub use queue::{Queue, QueueError, QueueHandler};

/// Computes the index values an object is filed under.
pub type IndexFunc<T> = fn(&T) -> Vec<String>;

pub const NAMESPACE_INDEX: &str = "namespace";
pub const APP_INDEX: &str = "app";
/// Label naming the owning application, read by [`app_index_func`].
pub const APP_LABEL: &str = "app";

pub fn namespace_index_func<T: Object>(obj: &T) -> Vec<String> {
    vec![obj.namespace().unwrap_or("").to_string()]
}

pub fn app_index_func<T: Object>(obj: &T) -> Vec<String> {
    obj.labels().get(APP_LABEL).map(|a| vec![a.clone()]).unwrap_or_default()
}

struct Inner<T> {
    items: FxHashMap<String, T>,
    // index name -> index value -> keys
    indices: FxHashMap<&'static str, FxHashMap<String, FxHashSet<String>>>,
}

/// Thread-safe key→object map with secondary indexes.
///
/// Writes replace the whole value under one lock, so readers never see a partial object.
pub struct Indexer<T> {
    key_func: ObjectKeyFunc<T>,
    indexers: FxHashMap<&'static str, IndexFunc<T>>,
    inner: RwLock<Inner<T>>,
}

impl<T: Object> Indexer<T> {
    /// New store keyed by `key_func`, with the namespace index installed.
    pub fn new(key_func: ObjectKeyFunc<T>) -> Self {
        let mut indexers: FxHashMap<&'static str, IndexFunc<T>> = FxHashMap::default();
        indexers.insert(NAMESPACE_INDEX, namespace_index_func::<T>);
        Self { key_func, indexers, inner: RwLock::new(Inner { items: FxHashMap::default(), indices: FxHashMap::default() }) }
    }

    /// Install an extra index. Must be called before the store is shared.
    pub fn with_index(mut self, name: &'static str, f: IndexFunc<T>) -> Self {
        self.indexers.insert(name, f);
        self
    }

    pub fn key_of(&self, obj: &T) -> CoreResult<String> { (self.key_func)(obj) }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner<T>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner<T>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    fn unindex(&self, inner: &mut Inner<T>, key: &str, obj: &T) {
        for (name, f) in self.indexers.iter() {
            if let Some(idx) = inner.indices.get_mut(name) {
                for v in f(obj) {
                    if let Some(set) = idx.get_mut(&v) {
                        set.remove(key);
                        if set.is_empty() { idx.remove(&v); }
                    }
                }
            }
        }
    }

    fn index(&self, inner: &mut Inner<T>, key: &str, obj: &T) {
        for (name, f) in self.indexers.iter() {
            let idx = inner.indices.entry(*name).or_default();
            for v in f(obj) {
                idx.entry(v).or_default().insert(key.to_string());
            }
        }
    }

    fn put_locked(&self, inner: &mut Inner<T>, key: String, obj: T) -> Option<T> {
        let old = inner.items.remove(&key);
        if let Some(o) = &old { self.unindex(inner, &key, o); }
        self.index(inner, &key, &obj);
        inner.items.insert(key, obj);
        old
    }

    /// Insert or replace by key; returns the previous value.
    pub fn add(&self, obj: T) -> CoreResult<Option<T>> {
        let key = self.key_of(&obj)?;
        let mut inner = self.write();
        Ok(self.put_locked(&mut inner, key, obj))
    }

    pub fn update(&self, obj: T) -> CoreResult<Option<T>> { self.add(obj) }

    pub fn delete(&self, obj: &T) -> CoreResult<Option<T>> {
        let key = self.key_of(obj)?;
        Ok(self.delete_key(&key))
    }

    pub fn delete_key(&self, key: &str) -> Option<T> {
        let mut inner = self.write();
        let old = inner.items.remove(key);
        if let Some(o) = &old { self.unindex(&mut inner, key, o); }
        old
    }

    pub fn get(&self, obj: &T) -> CoreResult<Option<T>> {
        let key = self.key_of(obj)?;
        Ok(self.get_by_key(&key))
    }

    pub fn get_by_key(&self, key: &str) -> Option<T> { self.read().items.get(key).cloned() }

    pub fn contains_key(&self, key: &str) -> bool { self.read().items.contains_key(key) }

    pub fn list(&self) -> Vec<T> { self.read().items.values().cloned().collect() }

    pub fn list_keys(&self) -> Vec<String> { self.read().items.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys filed under `value` in the named index.
    pub fn index_keys(&self, index: &str, value: &str) -> CoreResult<Vec<String>> {
        if !self.indexers.contains_key(index) {
            return Err(CoreError::Config(format!("unknown index: {}", index)));
        }
        let inner = self.read();
        Ok(inner
            .indices
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Objects filed under `value` in the named index.
    pub fn by_index(&self, index: &str, value: &str) -> CoreResult<Vec<T>> {
        if !self.indexers.contains_key(index) {
            return Err(CoreError::Config(format!("unknown index: {}", index)));
        }
        let inner = self.read();
        Ok(inner
            .indices
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|set| set.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
            .unwrap_or_default())
    }

    /// Swap the whole content in one step. Objects without a valid key are skipped.
    pub fn replace(&self, objs: Vec<T>) -> usize {
        let mut inner = self.write();
        inner.items.clear();
        inner.indices.clear();
        let mut skipped = 0usize;
        for o in objs {
            match self.key_of(&o) {
                Ok(k) => { self.put_locked(&mut inner, k, o); }
                Err(e) => { skipped += 1; tracing::warn!(error = %e, "store replace: skipping object without key"); }
            }
        }
        if skipped > 0 { tracing::debug!(skipped, "store replace done"); }
        inner.items.len()
    }
}
