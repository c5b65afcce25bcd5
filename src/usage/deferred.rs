//! Deferred `last_used_at` updates.
//!
//! The hot path only drops an account id into a map; a background flusher
//! batches the writes. Repeated touches within one flush window coalesce to
//! the latest timestamp.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::AccountStore;

/// Batching scheduler for account touch timestamps.
pub struct DeferredService {
    accounts: Arc<dyn AccountStore>,
    pending: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl DeferredService {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Record that the account served a request just now.
    pub fn schedule_touch(&self, account_id: Uuid) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(account_id, Utc::now());
    }

    /// Write all pending touches in one batch.
    pub async fn flush(&self) {
        let batch: Vec<(Uuid, DateTime<Utc>)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.accounts.touch_last_used(&batch).await {
            tracing::warn!(count = batch.len(), error = %e, "last_used_at flush failed");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Flush on a fixed cadence until the task is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                svc.flush().await;
            }
        })
    }
}
