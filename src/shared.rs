//! Cross-process shared state seam.
//!
//! The auth L2 tier, sticky-session bindings, concurrency slot counters,
//! and the cache-invalidation bus all live behind [`SharedStore`]. A
//! single-node deployment uses [`MemoryShared`]; clustered deployments swap
//! in a networked implementation behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// Capacity of each pub/sub channel. Slow subscribers lag and resync from
/// the authoritative tiers, so a small buffer is enough.
const BUS_CAPACITY: usize = 256;

/// Cross-process KV, counters, and pub/sub used by the request hot path.
///
/// All operations are advisory caches or counters: callers must degrade
/// gracefully when they fail.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a value. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Refresh the TTL of an existing key. No-op when absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically increment `key` unless the result would exceed `max`.
    /// Returns whether the increment was applied.
    async fn incr_capped(&self, key: &str, max: u64) -> Result<bool, StoreError>;

    /// Atomically increment `key` without a cap, returning the new value.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Atomically decrement `key`, flooring at zero. Returns the new value.
    async fn decr_floor(&self, key: &str) -> Result<u64, StoreError>;

    /// Read a counter value (zero when absent).
    async fn counter(&self, key: &str) -> Result<u64, StoreError>;

    /// Publish a payload to every subscriber of `channel`, including ones
    /// in other processes.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to `channel`. The receiver sees payloads published after
    /// the call.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process [`SharedStore`]. The shared semantics hold per process, which
/// is exactly what tests and single-node deployments need.
pub struct MemoryShared {
    kv: Mutex<HashMap<String, Entry>>,
    counters: Mutex<HashMap<String, u64>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryShared {
    pub fn new() -> Self {
        Self {
            kv: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryShared {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryShared {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut kv = self.kv.lock().unwrap_or_else(|e| e.into_inner());
        match kv.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().unwrap_or_else(|e| e.into_inner());
        kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().unwrap_or_else(|e| e.into_inner());
        kv.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = kv.get_mut(key) {
            if entry.expires_at > Instant::now() {
                entry.expires_at = Instant::now() + ttl;
            }
        }
        Ok(())
    }

    async fn incr_capped(&self, key: &str, max: u64) -> Result<bool, StoreError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let current = counters.entry(key.to_string()).or_insert(0);
        if *current >= max {
            return Ok(false);
        }
        *current += 1;
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let current = counters.entry(key.to_string()).or_insert(0);
        *current += 1;
        Ok(*current)
    }

    async fn decr_floor(&self, key: &str) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let current = counters.entry(key.to_string()).or_insert(0);
        *current = current.saturating_sub(1);
        Ok(*current)
    }

    async fn counter(&self, key: &str) -> Result<u64, StoreError> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        Ok(counters.get(key).copied().unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // Send fails only when there are no subscribers, which is fine.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}
