//! Cross-process per-account concurrency slots.
//!
//! Counters live in the shared store so every gateway instance observes the
//! same held/waiting numbers. Each acquisition hands back a [`SlotPermit`]
//! that must be released exactly once; an explicit async release is the
//! normal path and a spawn-on-drop backstop covers panic-equivalent
//! unwinds. A periodic sweep reconciles holds whose release never ran.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::StoreError;
use crate::shared::SharedStore;

/// Poll cadence while executing a wait plan.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Holds older than this are considered leaked by the cleanup sweep.
const STALE_HOLD_AGE: Duration = Duration::from_secs(30 * 60);

/// Load summary for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLoad {
    /// Percent of max concurrency currently held (0-100).
    pub load_rate: u32,
    pub current_in_use: u64,
    pub queued: u64,
}

/// A deferred acquisition: wait up to `timeout` for a slot on the account,
/// as long as fewer than `max_waiting` requests are already queued.
#[derive(Debug, Clone)]
pub struct WaitPlan {
    pub account_id: Uuid,
    pub max_concurrency: u32,
    pub timeout: Duration,
    pub max_waiting: u64,
}

struct Hold {
    account_id: Uuid,
    acquired_at: Instant,
}

/// Cross-process slot accounting.
pub struct ConcurrencyService {
    shared: Arc<dyn SharedStore>,
    /// Process-local registry of live holds, used by the cleanup sweep.
    holds: Mutex<HashMap<u64, Hold>>,
    next_hold_id: AtomicU64,
}

fn slot_key(account_id: Uuid) -> String {
    format!("slots:held:{account_id}")
}

fn wait_key(account_id: Uuid) -> String {
    format!("slots:waiting:{account_id}")
}

impl ConcurrencyService {
    pub fn new(shared: Arc<dyn SharedStore>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            holds: Mutex::new(HashMap::new()),
            next_hold_id: AtomicU64::new(1),
        })
    }

    /// Atomic test-and-increment. Returns `None` on overflow without
    /// reserving anything. `max_concurrency` of zero means unlimited.
    pub async fn acquire(
        self: &Arc<Self>,
        account_id: Uuid,
        max_concurrency: u32,
    ) -> Result<Option<SlotPermit>, StoreError> {
        let max = if max_concurrency == 0 {
            u64::MAX
        } else {
            max_concurrency as u64
        };
        if !self.shared.incr_capped(&slot_key(account_id), max).await? {
            return Ok(None);
        }

        let hold_id = self.next_hold_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
            holds.insert(
                hold_id,
                Hold {
                    account_id,
                    acquired_at: Instant::now(),
                },
            );
        }
        Ok(Some(SlotPermit {
            svc: Arc::clone(self),
            account_id,
            hold_id,
            released: AtomicBool::new(false),
        }))
    }

    /// Requests currently queued on the account's wait plans.
    pub async fn waiting_count(&self, account_id: Uuid) -> u64 {
        self.shared.counter(&wait_key(account_id)).await.unwrap_or(0)
    }

    /// Batch load info for candidate filtering and sorting.
    pub async fn load_batch(
        &self,
        accounts: &[(Uuid, u32)],
    ) -> Result<HashMap<Uuid, AccountLoad>, StoreError> {
        let mut out = HashMap::with_capacity(accounts.len());
        for (id, max_concurrency) in accounts {
            let in_use = self.shared.counter(&slot_key(*id)).await?;
            let queued = self.shared.counter(&wait_key(*id)).await?;
            let load_rate = if *max_concurrency == 0 {
                0
            } else {
                ((in_use * 100) / (*max_concurrency as u64)).min(100) as u32
            };
            out.insert(
                *id,
                AccountLoad {
                    load_rate,
                    current_in_use: in_use,
                    queued,
                },
            );
        }
        Ok(out)
    }

    /// Execute a wait plan: register as a waiter and poll for a slot until
    /// the plan's timeout. The waiter count never touches the held count.
    /// Returns `None` immediately when the queue is already full.
    pub async fn wait_for_slot(
        self: &Arc<Self>,
        plan: &WaitPlan,
    ) -> Result<Option<SlotPermit>, StoreError> {
        if self.waiting_count(plan.account_id).await >= plan.max_waiting {
            return Ok(None);
        }
        let wait_key = wait_key(plan.account_id);
        let _ = self.shared.incr(&wait_key).await;

        let deadline = Instant::now() + plan.timeout;
        let result = loop {
            match self.acquire(plan.account_id, plan.max_concurrency).await {
                Ok(Some(permit)) => break Ok(Some(permit)),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(None);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        };

        let _ = self.shared.decr_floor(&wait_key).await;
        result
    }

    /// Live holds registered in this process (test observability).
    pub fn live_holds(&self) -> usize {
        self.holds.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn release_hold(&self, hold_id: u64, account_id: Uuid) {
        let known = {
            let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
            holds.remove(&hold_id).is_some()
        };
        // Unknown hold: already reconciled by the sweep, do not double-decrement.
        if known {
            if let Err(e) = self.shared.decr_floor(&slot_key(account_id)).await {
                tracing::warn!(%account_id, error = %e, "slot release failed");
            }
        }
    }

    /// Reconcile leaked holds on a fixed cadence.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                svc.sweep_stale_holds(STALE_HOLD_AGE).await;
            }
        })
    }

    /// Drop holds older than `max_age` and return their slots.
    pub async fn sweep_stale_holds(&self, max_age: Duration) {
        let stale: Vec<(u64, Uuid)> = {
            let holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
            holds
                .iter()
                .filter(|(_, h)| h.acquired_at.elapsed() > max_age)
                .map(|(id, h)| (*id, h.account_id))
                .collect()
        };
        for (hold_id, account_id) in stale {
            tracing::warn!(%account_id, hold_id, "reclaiming leaked concurrency slot");
            self.release_hold(hold_id, account_id).await;
        }
    }
}

/// A held concurrency slot. Release exactly once via [`SlotPermit::release`];
/// dropping without releasing spawns the release as a backstop.
pub struct SlotPermit {
    svc: Arc<ConcurrencyService>,
    account_id: Uuid,
    hold_id: u64,
    released: AtomicBool,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("account_id", &self.account_id)
            .field("hold_id", &self.hold_id)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotPermit {
    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    /// Return the slot. Idempotent with the drop backstop.
    pub async fn release(self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.svc.release_hold(self.hold_id, self.account_id).await;
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let svc = Arc::clone(&self.svc);
        let hold_id = self.hold_id;
        let account_id = self.account_id;
        // Drop cannot await; hand the release to the runtime. Outside a
        // runtime (process teardown) the sweep covers it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                svc.release_hold(hold_id, account_id).await;
            });
        }
    }
}
