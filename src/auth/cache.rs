//! Two-tier auth cache with single-flight coalescing and cross-instance
//! invalidation.
//!
//! ```text
//! lookup ──► L1 (moka, jittered TTL) ──► L2 (shared KV) ──► key repo
//!                                         ▲                    │
//!                                         └──── write-back ◄───┘
//! invalidate ──► delete L2 ──► publish hash ──► peers drop L1
//! ```
//!
//! Ordering rules: successful loads write L2 before L1 before releasing the
//! single-flight; invalidators delete L2 before publishing so subscribers
//! cannot race-repopulate from a stale L2.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::snapshot::{AuthSnapshot, SNAPSHOT_SCHEMA_VERSION, sha256_hex};
use crate::config::AuthCacheConfig;
use crate::error::AuthError;
use crate::shared::SharedStore;
use crate::store::ApiKeyStore;

/// Bus channel carrying hashed cache keys to drop from every L1.
pub const INVALIDATION_CHANNEL: &str = "auth:invalidate";

/// L1 entry: a positive or negative result with its jittered deadline.
/// moka's own TTL is only a backstop; the deadline here is authoritative.
#[derive(Clone)]
struct L1Entry {
    value: Option<Arc<AuthSnapshot>>,
    expires_at: Instant,
}

/// Serialized L2 entry. Negative entries persist `found = false` with the
/// shorter negative TTL.
#[derive(Serialize, Deserialize)]
struct L2Entry {
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<AuthSnapshot>,
}

type FlightResult = Result<Option<Arc<AuthSnapshot>>, String>;

/// Two-tier cache in front of the API key repository.
pub struct AuthCache {
    cfg: AuthCacheConfig,
    l1: moka::future::Cache<String, L1Entry>,
    shared: Arc<dyn SharedStore>,
    keys: Arc<dyn ApiKeyStore>,
    /// In-flight repository loads keyed by hashed key. `std::sync::Mutex`:
    /// never held across an await point.
    flights: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
}

fn l2_key(hash: &str) -> String {
    format!("auth:snap:{hash}")
}

impl AuthCache {
    pub fn new(
        cfg: AuthCacheConfig,
        shared: Arc<dyn SharedStore>,
        keys: Arc<dyn ApiKeyStore>,
    ) -> Self {
        let l1 = moka::future::Cache::builder()
            .max_capacity(cfg.l1_size)
            // Backstop only; per-entry jittered deadlines expire first.
            .time_to_live(cfg.l1_ttl * 2)
            .build();
        Self {
            cfg,
            l1,
            shared,
            keys,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an opaque key string to its auth snapshot.
    ///
    /// The raw key is hashed before any cache interaction and never logged.
    pub async fn lookup(&self, raw_key: &str) -> Result<Arc<AuthSnapshot>, AuthError> {
        let hash = sha256_hex(raw_key);

        if let Some(entry) = self.l1.get(&hash).await {
            if entry.expires_at > Instant::now() {
                return entry.value.clone().ok_or(AuthError::KeyNotFound);
            }
            self.l1.invalidate(&hash).await;
        }

        if let Some(entry) = self.read_l2(&hash).await {
            return match entry {
                Some(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    self.fill_l1(&hash, Some(Arc::clone(&snapshot)), self.cfg.l1_ttl)
                        .await;
                    Ok(snapshot)
                }
                None => {
                    self.fill_l1(&hash, None, self.cfg.negative_ttl).await;
                    Err(AuthError::KeyNotFound)
                }
            };
        }

        let outcome = if self.cfg.singleflight {
            self.load_coalesced(raw_key, &hash).await
        } else {
            self.load_and_fill(raw_key, &hash).await
        };

        match outcome {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(AuthError::KeyNotFound),
            Err(message) => Err(AuthError::Store(crate::error::StoreError::Query(message))),
        }
    }

    /// Drop the entry for a raw key from both tiers and notify peers.
    pub async fn invalidate_key(&self, raw_key: &str) {
        self.invalidate_hash(&sha256_hex(raw_key)).await;
    }

    /// Drop a hashed entry from both tiers and notify peers.
    pub async fn invalidate_hash(&self, hash: &str) {
        // L2 first so a subscriber cannot repopulate from a stale entry.
        if let Err(e) = self.shared.delete(&l2_key(hash)).await {
            tracing::warn!(error = %e, "auth L2 delete failed during invalidation");
        }
        self.l1.invalidate(hash).await;
        if let Err(e) = self.shared.publish(INVALIDATION_CHANNEL, hash).await {
            tracing::warn!(error = %e, "auth invalidation publish failed");
        }
    }

    /// Invalidate every key owned by the user.
    pub async fn invalidate_user(&self, user_id: Uuid) -> Result<(), AuthError> {
        for hash in self.keys.list_key_hashes_by_user(user_id).await? {
            self.invalidate_hash(&hash).await;
        }
        Ok(())
    }

    /// Invalidate every key in the group.
    pub async fn invalidate_group(&self, group_id: Uuid) -> Result<(), AuthError> {
        for hash in self.keys.list_key_hashes_by_group(group_id).await? {
            self.invalidate_hash(&hash).await;
        }
        Ok(())
    }

    /// Subscribe to the invalidation bus and drop published hashes from
    /// this instance's L1. Runs until the bus closes.
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.shared.subscribe(INVALIDATION_CHANNEL);
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(hash) => cache.l1.invalidate(&hash).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed notifications: drop the whole L1 rather
                        // than serve entries we were told to forget.
                        tracing::warn!(skipped, "invalidation bus lagged, clearing L1");
                        cache.l1.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of live L1 entries (test observability).
    pub fn l1_entry_count(&self) -> u64 {
        self.l1.entry_count()
    }

    // ---- internals ----

    /// Read L2. Outer `None` = miss or degraded; inner option is the
    /// positive/negative payload.
    async fn read_l2(&self, hash: &str) -> Option<Option<AuthSnapshot>> {
        let raw = match self.shared.get(&l2_key(hash)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                // Shared-cache failures degrade silently to a miss.
                tracing::debug!(error = %e, "auth L2 read degraded to miss");
                return None;
            }
        };
        match serde_json::from_str::<L2Entry>(&raw) {
            Ok(L2Entry {
                found: true,
                snapshot: Some(snapshot),
            }) if snapshot.schema_version == SNAPSHOT_SCHEMA_VERSION => Some(Some(snapshot)),
            Ok(L2Entry { found: false, .. }) => Some(None),
            _ => {
                // Malformed or stale-schema entry must never shadow a load.
                None
            }
        }
    }

    async fn write_l2(&self, hash: &str, snapshot: Option<&AuthSnapshot>) {
        let entry = L2Entry {
            found: snapshot.is_some(),
            snapshot: snapshot.cloned(),
        };
        let ttl = if entry.found {
            self.cfg.l2_ttl
        } else {
            self.cfg.negative_ttl
        };
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if let Err(e) = self.shared.set(&l2_key(hash), &raw, ttl).await {
                    tracing::debug!(error = %e, "auth L2 write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "auth snapshot serialization failed"),
        }
    }

    async fn fill_l1(&self, hash: &str, value: Option<Arc<AuthSnapshot>>, ttl: Duration) {
        let entry = L1Entry {
            value,
            expires_at: Instant::now() + self.jittered(ttl),
        };
        self.l1.insert(hash.to_string(), entry).await;
    }

    /// Apply ± `jitter_percent` so batched fills don't expire together.
    fn jittered(&self, ttl: Duration) -> Duration {
        let pct = self.cfg.jitter_percent as i64;
        if pct == 0 {
            return ttl;
        }
        let offset = rand::thread_rng().gen_range(-pct..=pct);
        let millis = ttl.as_millis() as i64;
        Duration::from_millis((millis + millis * offset / 100).max(1) as u64)
    }

    /// Load through the single-flight coalescer: one repository call per
    /// hashed key, shared by every concurrent waiter.
    async fn load_coalesced(&self, raw_key: &str, hash: &str) -> FlightResult {
        let role = {
            let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            match flights.get(hash) {
                Some(sender) => Err(sender.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    flights.insert(hash.to_string(), tx.clone());
                    Ok(tx)
                }
            }
        };

        match role {
            Ok(tx) => {
                let result = self.load_and_fill(raw_key, hash).await;
                {
                    let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
                    flights.remove(hash);
                }
                // No waiters is fine.
                let _ = tx.send(result.clone());
                result
            }
            Err(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // Leader dropped without sending; treat as a transient error.
                Err(_) => Err("auth load coalescer interrupted".to_string()),
            },
        }
    }

    /// Load from the repository and populate both tiers. L2 is written
    /// before L1, and the caller releases the single-flight only after.
    async fn load_and_fill(&self, raw_key: &str, hash: &str) -> FlightResult {
        match self.keys.get_by_secret_for_auth(raw_key).await {
            Ok(Some(bundle)) => {
                let snapshot = Arc::new(AuthSnapshot::from_bundle(&bundle));
                self.write_l2(hash, Some(&snapshot)).await;
                self.fill_l1(hash, Some(Arc::clone(&snapshot)), self.cfg.l1_ttl)
                    .await;
                Ok(Some(snapshot))
            }
            Ok(None) => {
                self.write_l2(hash, None).await;
                self.fill_l1(hash, None, self.cfg.negative_ttl).await;
                Ok(None)
            }
            // Repository errors propagate and are never cached.
            Err(e) => Err(e.to_string()),
        }
    }
}
