//! Bounded event mailbox decoupling reflector callbacks from consumer tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use kestrel_api::EventHandler;
use kestrel_core::{Event, Object, OverflowPolicy};
use metrics::counter;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("queue full; event dropped")]
    Dropped,
    #[error("queue full; consumer disconnected")]
    Disconnected,
}

/// Multi-producer, multi-consumer bounded queue with an explicit overflow policy.
pub struct Queue<T> {
    name: String,
    tx: Sender<T>,
    rx: Receiver<T>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T: Send> Queue<T> {
    pub fn new(name: &str, cap: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = async_channel::bounded(cap.max(1));
        Self { name: name.to_string(), tx, rx, policy, dropped: AtomicU64::new(0) }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn policy(&self) -> OverflowPolicy { self.policy }
    pub fn len(&self) -> usize { self.rx.len() }
    pub fn is_empty(&self) -> bool { self.rx.is_empty() }
    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }

    /// Enqueue one item. Only waits when the buffer is full under `OverflowPolicy::Block`.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        match self.policy {
            OverflowPolicy::Block => self.tx.send(item).await.map_err(|_| QueueError::Closed),
            OverflowPolicy::DropNewest => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("queue_dropped_total", 1, "queue" => self.name.clone());
                    debug!(queue = %self.name, "queue full; dropping event");
                    Err(QueueError::Dropped)
                }
                Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            },
            OverflowPolicy::Disconnect => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!(queue = %self.name, "queue full; closing slow consumer");
                    counter!("queue_disconnects_total", 1, "queue" => self.name.clone());
                    self.tx.close();
                    Err(QueueError::Disconnected)
                }
                Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            },
        }
    }

    /// Blocking pop. `None` once the queue is closed and drained.
    pub async fn get(&self) -> Option<T> { self.rx.recv().await.ok() }

    /// Non-blocking pop.
    pub fn aget(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// The underlying receiver, for consumers that want to select over it.
    pub fn get_channel(&self) -> Receiver<T> { self.rx.clone() }

    /// Close for producers; already queued items can still be drained. Returns false if already closed.
    pub fn close(&self) -> bool { self.tx.close() }
}

/// Adapts a queue of events into reflector callbacks.
pub struct QueueHandler<T> {
    queue: Arc<Queue<Event<T>>>,
}

impl<T: Object> QueueHandler<T> {
    pub fn new(queue: Arc<Queue<Event<T>>>) -> Self { Self { queue } }

    async fn push(&self, ev: Event<T>) {
        if let Err(e) = self.queue.push(ev).await {
            debug!(queue = %self.queue.name(), error = %e, "event not queued");
        }
    }
}

#[async_trait::async_trait]
impl<T: Object> EventHandler<T> for QueueHandler<T> {
    async fn on_add(&self, obj: &T) { self.push(Event::Added(obj.clone())).await; }
    async fn on_update(&self, _old: &T, new: &T) { self.push(Event::Updated(new.clone())).await; }
    async fn on_delete(&self, obj: &T) { self.push(Event::Deleted(obj.clone())).await; }
}
