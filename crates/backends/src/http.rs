//! HTTP event API backend.
//!
//! Plain requests answer with one envelope `{code, message, data}`; `code == 0` is
//! success. Watches are a long-lived `GET ..?watch=true` whose body is a sequence of
//! newline-delimited envelopes wrapping `{type, data}` events. A non-zero code or a
//! malformed line ends the stream; reconnecting is the caller's business.

use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use kestrel_api::{Storage, StorageError, StorageResult, WatchHandle, WatchSender};
use kestrel_core::{split_key, validate_key, Event, EventType, Layout, Object, Selector};
use metrics::counter;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Response wrapper shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<D> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<D>,
}

/// Payload of one watch line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

const NOT_FOUND_CODE: i64 = 404;

pub struct HttpStorage<T> {
    client: reqwest::Client,
    base: String,
    layout: Layout,
    capacity: usize,
    watches: Mutex<Vec<CancellationToken>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> HttpStorage<T> {
    pub fn new(base_url: &str, layout: Layout) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, layout)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, layout: Layout) -> Self {
        Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
            layout,
            capacity: 128,
            watches: Mutex::new(Vec::new()),
            _kind: PhantomData,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn base_url(&self) -> &str { &self.base }

    fn url(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        let segs = split_key(key);
        Ok(if segs.is_empty() { format!("{}/apis", self.base) } else { format!("{}/apis/{}", self.base, segs.join("/")) })
    }

    /// Detail paths address one object and are written with PUT; collections take POST.
    fn write_method(&self, key: &str) -> Method {
        if split_key(key).len() >= self.layout.detail_segments() { Method::PUT } else { Method::POST }
    }

    async fn call(&self, req: reqwest::RequestBuilder, url: &str) -> StorageResult<Envelope<Value>> {
        let resp = req.send().await.map_err(|e| StorageError::Backend(format!("{url}: {e}")))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.to_string()));
        }
        let body = resp.bytes().await.map_err(|e| StorageError::Backend(format!("{url}: {e}")))?;
        let env: Envelope<Value> = serde_json::from_slice(&body).map_err(|e| {
            if status.is_success() {
                StorageError::Backend(format!("{url}: malformed envelope: {e}"))
            } else {
                StorageError::Backend(format!("{url}: http {status}"))
            }
        })?;
        match env.code {
            0 => Ok(env),
            NOT_FOUND_CODE => Err(StorageError::NotFound(url.to_string())),
            code => Err(StorageError::Backend(format!("{url}: code {code}: {}", env.message))),
        }
    }
}

fn decode_value<T: DeserializeOwned>(v: Value, ctx: &str) -> Option<T> {
    match serde_json::from_value(v) {
        Ok(obj) => Some(obj),
        Err(e) => {
            counter!("backend_decode_errors_total", 1, "backend" => "http");
            warn!(ctx = %ctx, error = %e, "http: decode failed; skipping");
            None
        }
    }
}

fn optional_object<T: DeserializeOwned>(data: Option<Value>, ctx: &str) -> Option<T> {
    data.filter(|v| !v.is_null()).and_then(|v| decode_value(v, ctx))
}

/// Parse one watch line. `Err` carries the reason the stream must end.
pub fn parse_line<T: DeserializeOwned>(line: &str) -> Result<Event<T>, String> {
    let env: Envelope<WireEvent> = serde_json::from_str(line).map_err(|e| format!("malformed line: {e}"))?;
    if env.code != 0 {
        return Err(format!("code {}: {}", env.code, env.message));
    }
    let wire = env.data.ok_or_else(|| "envelope without data".to_string())?;
    let kind = EventType::from_wire(&wire.kind).ok_or_else(|| format!("unknown event type {}", wire.kind))?;
    if kind == EventType::Error {
        return Ok(Event::Error(wire.data.as_str().map(str::to_string).unwrap_or_else(|| wire.data.to_string())));
    }
    let obj = serde_json::from_value(wire.data).map_err(|e| format!("undecodable object: {e}"))?;
    Ok(Event::new(kind, obj))
}

/// Split a chunked byte stream into lines and forward parsed events until the stream
/// ends, a line is rejected, the consumer goes away, or `cancel` fires.
pub(crate) async fn pump_lines<S, E, T>(stream: S, tx: WatchSender<T>, cancel: CancellationToken, selector: Selector, ctx: String)
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
    T: Object + DeserializeOwned,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { debug!(ctx = %ctx, "http: watch cancelled"); return; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            let text = String::from_utf8_lossy(&line);
                            let text = text.trim();
                            if text.is_empty() { continue; }
                            match parse_line::<T>(text) {
                                Ok(Event::Error(msg)) => {
                                    warn!(ctx = %ctx, error = %msg, "http: error event");
                                    if !tx.send(Event::Error(msg)).await { return; }
                                }
                                Ok(ev) => {
                                    let keep = ev.object().map(|o| selector.matches_object(o)).unwrap_or(true);
                                    if keep && !tx.send(ev).await { return; }
                                }
                                Err(reason) => {
                                    warn!(ctx = %ctx, reason = %reason, "http: watch stream rejected");
                                    let _ = tx.send(Event::Error(reason)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "http: watch read failed"); return; }
                    None => { debug!(ctx = %ctx, "http: watch stream ended"); return; }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T> Storage<T> for HttpStorage<T>
where
    T: Object + Serialize + DeserializeOwned,
{
    async fn create(&self, key: &str, obj: &T, ttl_secs: u64) -> StorageResult<Option<T>> {
        let url = self.url(key)?;
        let method = self.write_method(key);
        let mut req = self.client.request(method.clone(), &url).json(obj);
        if ttl_secs > 0 {
            req = req.query(&[("ttl", ttl_secs.to_string())]);
        }
        let env = self.call(req, &url).await?;
        info!(url = %url, method = %method, "http: create ok");
        Ok(optional_object(env.data, &url))
    }

    async fn delete(&self, key: &str) -> StorageResult<Option<T>> {
        let url = self.url(key)?;
        let env = self.call(self.client.delete(&url), &url).await?;
        info!(url = %url, "http: delete ok");
        Ok(optional_object(env.data, &url))
    }

    async fn get(&self, key: &str, ignore_not_found: bool) -> StorageResult<Option<T>> {
        let url = self.url(key)?;
        match self.call(self.client.get(&url), &url).await {
            Ok(env) => match env.data.filter(|v| !v.is_null()) {
                Some(v) => Ok(Some(serde_json::from_value(v).map_err(kestrel_core::CoreError::from)?)),
                None if ignore_not_found => Ok(None),
                None => Err(StorageError::NotFound(url)),
            },
            Err(e) if e.is_not_found() && ignore_not_found => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, key: &str, selector: &Selector) -> StorageResult<Vec<T>> {
        let url = self.url(key)?;
        let started = std::time::Instant::now();
        let env = self.call(self.client.get(&url).query(&selector.query_pairs()), &url).await?;
        let values = match env.data {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single],
        };
        let out: Vec<T> = values
            .into_iter()
            .filter_map(|v| decode_value::<T>(v, &url))
            .filter(|o| selector.matches_object(o))
            .collect();
        debug!(url = %url, items = out.len(), took_ms = started.elapsed().as_millis() as u64, "http: list ok");
        Ok(out)
    }

    async fn watch(&self, key: &str, selector: &Selector) -> StorageResult<WatchHandle<T>> {
        let url = self.url(key)?;
        let mut query = selector.query_pairs();
        query.push(("watch", "true".to_string()));
        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("{url}: {e}")))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url));
        }
        if !resp.status().is_success() {
            return Err(StorageError::Backend(format!("{url}: http {}", resp.status())));
        }
        let (tx, handle) = WatchHandle::channel(self.capacity);
        let token = handle.cancel_token();
        {
            let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            watches.retain(|t| !t.is_cancelled());
            watches.push(token.clone());
        }
        tokio::spawn(pump_lines(resp.bytes_stream(), tx, token, selector.clone(), url.clone()));
        info!(url = %url, selector = %selector, "http: watch start");
        Ok(handle)
    }

    async fn close(&self) {
        let watches = std::mem::take(&mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner));
        for t in &watches {
            t.cancel();
        }
        info!(base = %self.base, watches = watches.len(), "http: closed");
    }
}

/// Client whose connect phase is bounded; watch bodies stay open indefinitely.
pub fn client_with_timeout(connect: Duration) -> StorageResult<reqwest::Client> {
    reqwest::Client::builder().connect_timeout(connect).build().map_err(|e| StorageError::Config(e.to_string()))
}
