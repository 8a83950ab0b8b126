//! Kestrel core types: the object capability model, events, codecs and key layout.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod config;
pub mod selector;

pub use config::{OverflowPolicy, Settings};
pub use selector::{LabelSelector, Requirement, Selector};

/// Annotation set on objects rebuilt from a deletion notification that carried no payload.
pub const SYNTHESIZED_ANNOTATION: &str = "kestrel.io/synthesized-on-delete";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("config: {0}")]
    Config(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Identity and bookkeeping fields shared by every cached entity.
///
/// Flattened into concrete kinds, so the wire shape is
/// `{"name": .., "namespace": .., "labels": {..}, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { name: name.to_string(), namespace: namespace.map(|s| s.to_string()), ..Default::default() }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Capability set every cached entity implements.
///
/// `Default` doubles as the factory used when a backend must fabricate an
/// object (deletions without payload).
pub trait Object: Clone + PartialEq + Default + fmt::Debug + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str { &self.meta().name }
    fn namespace(&self) -> Option<&str> { self.meta().namespace.as_deref() }
    fn cluster(&self) -> Option<&str> { self.meta().cluster.as_deref() }
    fn labels(&self) -> &BTreeMap<String, String> { &self.meta().labels }
    fn annotations(&self) -> &BTreeMap<String, String> { &self.meta().annotations }
    fn creation_timestamp(&self) -> Option<DateTime<Utc>> { self.meta().creation_timestamp }

    fn set_labels(&mut self, labels: BTreeMap<String, String>) { self.meta_mut().labels = labels; }
    fn set_annotations(&mut self, annotations: BTreeMap<String, String>) { self.meta_mut().annotations = annotations; }
    fn set_creation_timestamp(&mut self, ts: DateTime<Utc>) { self.meta_mut().creation_timestamp = Some(ts); }

    /// `(namespace, name)` identity used for dedup.
    fn identity(&self) -> (Option<&str>, &str) { (self.namespace(), self.name()) }
}

/// Schema-less object: metadata plus every other top-level field kept as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawObject {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { meta: ObjectMeta::new(namespace, name), fields: serde_json::Map::new() }
    }

    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

impl Object for RawObject {
    fn meta(&self) -> &ObjectMeta { &self.meta }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.meta }
}

/// Build the minimal object standing in for a deleted entity whose payload is gone.
pub fn synthesize_deleted<T: Object>(namespace: Option<&str>, name: &str) -> T {
    let mut obj = T::default();
    {
        let meta = obj.meta_mut();
        meta.name = name.to_string();
        meta.namespace = namespace.map(|s| s.to_string());
        meta.annotations.insert(SYNTHESIZED_ANNOTATION.to_string(), "true".to_string());
    }
    obj
}

pub fn is_synthesized<T: Object>(obj: &T) -> bool {
    obj.annotations().get(SYNTHESIZED_ANNOTATION).map(|v| v == "true").unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
    Sync,
    Error,
}

impl EventType {
    /// Wire spelling used by the HTTP event API.
    pub fn as_wire(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Updated => "UPDATED",
            EventType::Deleted => "DELETED",
            EventType::Sync => "SYNC",
            EventType::Error => "ERROR",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ADDED" => Some(EventType::Added),
            "UPDATED" | "MODIFIED" => Some(EventType::Updated),
            "DELETED" => Some(EventType::Deleted),
            "SYNC" => Some(EventType::Sync),
            "ERROR" => Some(EventType::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_wire()) }
}

/// A single change notification. Every variant but `Error` carries an object.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    Added(T),
    Updated(T),
    Deleted(T),
    Sync(T),
    Error(String),
}

impl<T> Event<T> {
    pub fn new(kind: EventType, obj: T) -> Self {
        match kind {
            EventType::Added => Event::Added(obj),
            EventType::Updated => Event::Updated(obj),
            EventType::Deleted => Event::Deleted(obj),
            EventType::Sync => Event::Sync(obj),
            EventType::Error => Event::Error(String::new()),
        }
    }

    pub fn kind(&self) -> EventType {
        match self {
            Event::Added(_) => EventType::Added,
            Event::Updated(_) => EventType::Updated,
            Event::Deleted(_) => EventType::Deleted,
            Event::Sync(_) => EventType::Sync,
            Event::Error(_) => EventType::Error,
        }
    }

    pub fn object(&self) -> Option<&T> {
        match self {
            Event::Added(o) | Event::Updated(o) | Event::Deleted(o) | Event::Sync(o) => Some(o),
            Event::Error(_) => None,
        }
    }

    pub fn into_object(self) -> Option<T> {
        match self {
            Event::Added(o) | Event::Updated(o) | Event::Deleted(o) | Event::Sync(o) => Some(o),
            Event::Error(_) => None,
        }
    }
}

/// Converts objects to and from their stored byte form.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, obj: &T) -> CoreResult<Vec<u8>>;
    fn decode(&self, raw: &[u8]) -> CoreResult<T>;
}

pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self { Self(PhantomData) }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self { Self::new() }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, obj: &T) -> CoreResult<Vec<u8>> { Ok(serde_json::to_vec(obj)?) }
    fn decode(&self, raw: &[u8]) -> CoreResult<T> { Ok(serde_json::from_slice(raw)?) }
}

/// Derives the local-store key of an object.
pub type ObjectKeyFunc<T> = fn(&T) -> CoreResult<String>;

/// Default key function: `namespace/name`, or `name` for objects without a namespace.
pub fn namespace_key_func<T: Object>(obj: &T) -> CoreResult<String> {
    if obj.name().is_empty() {
        return Err(CoreError::InvalidKey("object has no name".into()));
    }
    Ok(match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name()),
        _ => obj.name().to_string(),
    })
}

/// Whether a kind's paths carry a namespace segment between type and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    Namespaced,
    Flat,
}

impl Layout {
    /// Number of key segments (`type/ns/name` or `type/name`) addressing a single object.
    pub fn detail_segments(&self) -> usize {
        match self {
            Layout::Namespaced => 3,
            Layout::Flat => 2,
        }
    }
}

pub fn trim_key(key: &str) -> &str { key.trim_matches('/') }

/// Count of `/` separators in a trimmed key; empty keys have depth 0.
pub fn key_depth(key: &str) -> usize { trim_key(key).matches('/').count() }

pub fn split_key(key: &str) -> Vec<&str> {
    trim_key(key).split('/').filter(|s| !s.is_empty()).collect()
}

/// Join a prefix and a relative key with exactly one separator, tolerating empty parts.
pub fn join_key(prefix: &str, key: &str) -> String {
    let p = prefix.trim_end_matches('/');
    let k = trim_key(key);
    match (p.is_empty(), k.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", k),
        (false, true) => p.to_string(),
        (false, false) => format!("{}/{}", p, k),
    }
}

/// Reject keys with empty segments or relative components.
pub fn validate_key(key: &str) -> CoreResult<()> {
    let t = trim_key(key);
    if t.is_empty() { return Ok(()); }
    for seg in t.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            return Err(CoreError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

pub mod prelude {
    pub use super::{
        is_synthesized, namespace_key_func, synthesize_deleted, Codec, CoreError, Event, EventType, JsonCodec,
        Layout, Object, ObjectKeyFunc, ObjectMeta, RawObject, Selector,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_object_keeps_meta_and_extra_fields() {
        let raw = br#"{"name":"app1","namespace":"ns1","labels":{"tier":"web"},"spec":{"replicas":3}}"#;
        let obj: RawObject = JsonCodec::new().decode(raw).expect("decode");
        assert_eq!(obj.name(), "app1");
        assert_eq!(obj.namespace(), Some("ns1"));
        assert_eq!(obj.labels().get("tier").map(String::as_str), Some("web"));
        assert_eq!(obj.fields.get("spec"), Some(&serde_json::json!({"replicas": 3})));
        assert!(!obj.fields.contains_key("name"));
    }

    #[test]
    fn synthesized_objects_are_marked() {
        let obj: RawObject = synthesize_deleted(Some("ns1"), "app1");
        assert_eq!(obj.identity(), (Some("ns1"), "app1"));
        assert!(is_synthesized(&obj));
        assert!(obj.labels().is_empty());
        assert!(!is_synthesized(&RawObject::new(Some("ns1"), "app1")));
    }

    #[test]
    fn key_func_uses_namespace_when_present() {
        assert_eq!(namespace_key_func(&RawObject::new(Some("ns"), "a")).unwrap(), "ns/a");
        assert_eq!(namespace_key_func(&RawObject::new(None, "a")).unwrap(), "a");
        assert!(namespace_key_func(&RawObject::default()).is_err());
    }

    #[test]
    fn key_helpers() {
        assert_eq!(key_depth(""), 0);
        assert_eq!(key_depth("apps"), 0);
        assert_eq!(key_depth("apps/ns1/"), 1);
        assert_eq!(key_depth("/apps/ns1/app1"), 2);
        assert_eq!(join_key("/kestrel", "apps/ns1"), "/kestrel/apps/ns1");
        assert_eq!(join_key("/kestrel/", ""), "/kestrel");
        assert_eq!(join_key("", "a"), "/a");
        assert!(validate_key("apps//x").is_err());
        assert!(validate_key("apps/../x").is_err());
        assert!(validate_key("").is_ok());
    }

    #[test]
    fn event_wire_names() {
        assert_eq!(EventType::from_wire("ADDED"), Some(EventType::Added));
        assert_eq!(EventType::from_wire("modified"), Some(EventType::Updated));
        assert_eq!(EventType::from_wire("nope"), None);
        let ev = Event::new(EventType::Deleted, 7u8);
        assert_eq!(ev.kind(), EventType::Deleted);
        assert_eq!(ev.into_object(), Some(7));
    }
}
