//! Runtime settings read from `KESTREL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// What a bounded channel does when its consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Wait for room; a slow consumer stalls the producer.
    #[default]
    Block,
    /// Drop the event for this consumer only.
    DropNewest,
    /// Close the slow consumer.
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" | "drop-newest" | "dropnewest" => Ok(OverflowPolicy::DropNewest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(CoreError::Config(format!("unknown overflow policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub resync_secs: u64,
    pub watch_health_secs: u64,
    pub queue_cap: usize,
    pub overflow: OverflowPolicy,
    pub tree_supervise_secs: u64,
    pub tree_force_sync_secs: u64,
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resync_secs: 1800,
            watch_health_secs: 2,
            queue_cap: 128,
            overflow: OverflowPolicy::Block,
            tree_supervise_secs: 3,
            tree_force_sync_secs: 300,
            metrics_addr: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl Settings {
    /// Defaults overridden by any well-formed `KESTREL_*` variable.
    pub fn from_env() -> Self {
        let d = Self::default();
        let overflow = match std::env::var("KESTREL_OVERFLOW") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring KESTREL_OVERFLOW");
                d.overflow
            }),
            Err(_) => d.overflow,
        };
        Self {
            resync_secs: env_parse("KESTREL_RESYNC_SECS").unwrap_or(d.resync_secs),
            watch_health_secs: env_parse("KESTREL_WATCH_HEALTH_SECS").unwrap_or(d.watch_health_secs),
            queue_cap: env_parse::<usize>("KESTREL_QUEUE_CAP").map(|c| c.max(1)).unwrap_or(d.queue_cap),
            overflow,
            tree_supervise_secs: env_parse("KESTREL_TREE_SUPERVISE_SECS").unwrap_or(d.tree_supervise_secs),
            tree_force_sync_secs: env_parse("KESTREL_TREE_FORCE_SYNC_SECS").unwrap_or(d.tree_force_sync_secs),
            metrics_addr: std::env::var("KESTREL_METRICS_ADDR").ok(),
        }
    }

    pub fn resync_period(&self) -> Duration { Duration::from_secs(self.resync_secs.max(1)) }
    pub fn watch_health_interval(&self) -> Duration { Duration::from_secs(self.watch_health_secs.max(1)) }
    pub fn tree_supervise_interval(&self) -> Duration { Duration::from_secs(self.tree_supervise_secs.max(1)) }
    pub fn tree_force_sync_interval(&self) -> Duration { Duration::from_secs(self.tree_force_sync_secs.max(1)) }
}
