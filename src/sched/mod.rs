//! Account selection.
//!
//! Three layers, tried in order: sticky session affinity, load-aware
//! selection over schedulable candidates, and a fallback wait plan when no
//! slot could be acquired anywhere. Every `Acquired` selection carries a
//! permit that the caller must release on every exit path; a wait plan
//! never increments the held count.

pub mod slots;

pub use slots::{AccountLoad, ConcurrencyService, SlotPermit, WaitPlan};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::auth::AuthSnapshot;
use crate::auth::snapshot::sha256_hex;
use crate::config::SchedConfig;
use crate::error::ScheduleError;
use crate::model::{Account, Platform};
use crate::shared::SharedStore;
use crate::store::AccountStore;

/// Sticky bindings live for an hour, refreshed on every hit.
const STICKY_TTL: Duration = Duration::from_secs(3600);

/// How long a cached account snapshot stays fresh before the repository is
/// consulted again. Decision sites re-check schedulability regardless.
const SNAPSHOT_TTL: Duration = Duration::from_secs(2);

/// One account-selection request.
pub struct SelectRequest<'a> {
    pub snapshot: &'a AuthSnapshot,
    pub platform: Platform,
    pub model: &'a str,
    /// Raw session identity (header or body key); hashed before use.
    pub session: Option<&'a str>,
    pub thinking: bool,
    /// Accounts already tried by the in-request failover loop.
    pub excluded: &'a HashSet<Uuid>,
}

/// Outcome of a selection.
#[derive(Debug)]
pub enum Selection {
    /// A slot was acquired; the permit must be released on every exit path.
    Acquired {
        account: Box<Account>,
        permit: SlotPermit,
    },
    /// No slot was free; the caller may execute the wait plan.
    Wait {
        account: Box<Account>,
        plan: WaitPlan,
    },
}

/// Account selector over the shared pool.
pub struct Scheduler {
    accounts: Arc<dyn AccountStore>,
    shared: Arc<dyn SharedStore>,
    slots: Arc<ConcurrencyService>,
    cfg: SchedConfig,
    /// Throttled per-platform candidate snapshot.
    cache: Mutex<HashMap<Platform, (Instant, Vec<Account>)>>,
}

fn sticky_key(group_id: Option<Uuid>, session: &str) -> String {
    let hash = sha256_hex(session);
    match group_id {
        Some(group) => format!("sticky:{group}:openai:{hash}"),
        None => format!("sticky:global:openai:{hash}"),
    }
}

impl Scheduler {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        shared: Arc<dyn SharedStore>,
        slots: Arc<ConcurrencyService>,
        cfg: SchedConfig,
    ) -> Self {
        Self {
            accounts,
            shared,
            slots,
            cfg,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn slots(&self) -> &Arc<ConcurrencyService> {
        &self.slots
    }

    /// Pick exactly one account for the request.
    pub async fn select(&self, req: &SelectRequest<'_>) -> Result<Selection, ScheduleError> {
        if let Some(selection) = self.try_sticky(req).await? {
            return Ok(selection);
        }

        let candidates = self.candidates(req).await?;
        if candidates.is_empty() {
            return Err(ScheduleError::NoAvailableAccounts {
                model: Some(req.model.to_string()),
            });
        }

        let ordered = self.order_candidates(candidates.clone()).await;

        for account in &ordered {
            if let Some(permit) = self
                .slots
                .acquire(account.id, account.max_concurrency)
                .await?
            {
                if let Some(session) = req.session {
                    self.bind_sticky(req.snapshot.group_id, session, account.id)
                        .await;
                }
                return Ok(Selection::Acquired {
                    account: Box::new(account.clone()),
                    permit,
                });
            }
        }

        // Every candidate is full (the load filter may even have emptied
        // `ordered`): wait on the best priority+LRU candidate of the full
        // schedulable set.
        let best = best_by_priority_lru(candidates);
        let plan = WaitPlan {
            account_id: best.id,
            max_concurrency: best.max_concurrency,
            timeout: self.cfg.fallback_wait_timeout,
            max_waiting: self.cfg.fallback_max_waiting,
        };
        Ok(Selection::Wait {
            account: Box::new(best),
            plan,
        })
    }

    // ---- layer 1: sticky session ----

    async fn try_sticky(
        &self,
        req: &SelectRequest<'_>,
    ) -> Result<Option<Selection>, ScheduleError> {
        let Some(session) = req.session else {
            return Ok(None);
        };
        let key = sticky_key(req.snapshot.group_id, session);

        let bound = match self.shared.get(&key).await {
            Ok(Some(raw)) => match Uuid::parse_str(&raw) {
                Ok(id) => id,
                Err(_) => {
                    let _ = self.shared.delete(&key).await;
                    return Ok(None);
                }
            },
            Ok(None) => return Ok(None),
            // Shared-store trouble: skip stickiness rather than fail.
            Err(e) => {
                tracing::debug!(error = %e, "sticky read degraded");
                return Ok(None);
            }
        };

        let Some(account) = self.accounts.get(bound).await? else {
            let _ = self.shared.delete(&key).await;
            return Ok(None);
        };

        let now = Utc::now();
        let fits = account.platform == req.platform
            && account.is_schedulable_for(req.model, now)
            && (!req.thinking || account.supports_thinking);

        if !fits {
            // Permanently unfit for this session: rate-limited, disabled,
            // model or thinking mismatch. Exclusion alone keeps the binding.
            let _ = self.shared.delete(&key).await;
            return Ok(None);
        }
        if req.excluded.contains(&account.id) {
            return Ok(None);
        }

        if let Some(permit) = self
            .slots
            .acquire(account.id, account.max_concurrency)
            .await?
        {
            let _ = self.shared.expire(&key, STICKY_TTL).await;
            return Ok(Some(Selection::Acquired {
                account: Box::new(account),
                permit,
            }));
        }

        if self.slots.waiting_count(account.id).await < self.cfg.sticky_max_waiting {
            let plan = WaitPlan {
                account_id: account.id,
                max_concurrency: account.max_concurrency,
                timeout: self.cfg.sticky_wait_timeout,
                max_waiting: self.cfg.sticky_max_waiting,
            };
            return Ok(Some(Selection::Wait {
                account: Box::new(account),
                plan,
            }));
        }

        // Slot-full and queue-full, but the account itself is still fit:
        // keep the binding and fall through to load-aware selection.
        Ok(None)
    }

    async fn bind_sticky(&self, group_id: Option<Uuid>, session: &str, account_id: Uuid) {
        let key = sticky_key(group_id, session);
        if let Err(e) = self
            .shared
            .set(&key, &account_id.to_string(), STICKY_TTL)
            .await
        {
            tracing::debug!(error = %e, "sticky bind failed");
        }
    }

    // ---- layer 2: load-aware selection ----

    async fn candidates(&self, req: &SelectRequest<'_>) -> Result<Vec<Account>, ScheduleError> {
        let pool = self.platform_snapshot(req.platform).await?;
        let routed = req.snapshot.routed_accounts(req.model);
        let now = Utc::now();

        Ok(pool
            .into_iter()
            .filter(|account| {
                // Snapshots may be slightly stale: re-check at decision time.
                account.is_schedulable_for(req.model, now)
                    && !req.excluded.contains(&account.id)
                    && (!req.thinking || account.supports_thinking)
                    && routed.is_none_or(|ids| ids.contains(&account.id))
            })
            .collect())
    }

    async fn platform_snapshot(&self, platform: Platform) -> Result<Vec<Account>, ScheduleError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, accounts)) = cache.get(&platform) {
                if at.elapsed() < SNAPSHOT_TTL {
                    return Ok(accounts.clone());
                }
            }
        }
        let accounts = self.accounts.list_schedulable(platform).await?;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(platform, (Instant::now(), accounts.clone()));
        Ok(accounts)
    }

    /// Sort candidates by (priority asc, load asc, LRU), shuffling ties so
    /// equal accounts spread traffic. Falls back to priority+LRU when batch
    /// load info is unavailable or disabled.
    async fn order_candidates(&self, mut candidates: Vec<Account>) -> Vec<Account> {
        let loads = if self.cfg.load_batch_enabled {
            let request: Vec<(Uuid, u32)> = candidates
                .iter()
                .map(|a| (a.id, a.max_concurrency))
                .collect();
            match self.slots.load_batch(&request).await {
                Ok(loads) => Some(loads),
                Err(e) => {
                    tracing::debug!(error = %e, "load batch unavailable, using priority+LRU");
                    None
                }
            }
        } else {
            None
        };

        if let Some(loads) = &loads {
            candidates.retain(|a| {
                loads
                    .get(&a.id)
                    .is_none_or(|l| l.load_rate < 100)
            });
        }

        let sort_key = |account: &Account| {
            let load = loads
                .as_ref()
                .and_then(|l| l.get(&account.id))
                .map(|l| l.load_rate)
                .unwrap_or(0);
            // Null last_used_at sorts first.
            let lru = account
                .last_used_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(i64::MIN);
            (account.priority, load, lru)
        };

        candidates.sort_by_key(sort_key);
        shuffle_equal_runs(&mut candidates, sort_key);
        candidates
    }
}

/// Simple-path ordering: priority ascending, then null `last_used_at`
/// first, then earliest `last_used_at`. Callers guarantee non-emptiness.
fn best_by_priority_lru(mut candidates: Vec<Account>) -> Account {
    candidates.sort_by_key(|account| {
        (
            account.priority,
            account
                .last_used_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(i64::MIN),
        )
    });
    candidates.swap_remove(0)
}

/// Shuffle maximal runs of elements with equal sort keys in place, keeping
/// the overall order stable between runs.
fn shuffle_equal_runs<T, K: Eq, F: Fn(&T) -> K>(items: &mut [T], key: F) {
    let mut rng = rand::thread_rng();
    let mut start = 0;
    while start < items.len() {
        let mut end = start + 1;
        while end < items.len() && key(&items[end]) == key(&items[start]) {
            end += 1;
        }
        if end - start > 1 {
            items[start..end].shuffle(&mut rng);
        }
        start = end;
    }
}
