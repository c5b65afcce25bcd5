//! Usage recording: one durable row per request, then money movement.
//!
//! The usage-log insert is the fence: side-effects (subscription usage,
//! balance deduction, per-key quota) fire only when the row was inserted,
//! or when the insert errored ambiguously, since the row may exist. A
//! duplicate request id short-circuits everything.

pub mod costs;
pub mod deferred;

pub use costs::{CostBreakdown, compute_cost};
pub use deferred::DeferredService;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::auth::{AuthCache, AuthSnapshot};
use crate::config::RunMode;
use crate::model::{BillingType, SubscriptionType, Usage, UsageLog};
use crate::store::{
    ApiKeyStore, OpsSink, ProjectionEvent, SubscriptionStore, UsageLogStore, UserStore,
};

/// Everything the recorder needs about one finished forward.
pub struct RecordContext {
    pub request_id: String,
    pub snapshot: Arc<AuthSnapshot>,
    pub account_id: Uuid,
    pub model: String,
    pub usage: Usage,
    pub stream: bool,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
}

/// Turns forward results into usage rows and billing side-effects.
pub struct UsageRecorder {
    logs: Arc<dyn UsageLogStore>,
    users: Arc<dyn UserStore>,
    keys: Arc<dyn ApiKeyStore>,
    subs: Arc<dyn SubscriptionStore>,
    auth_cache: Arc<AuthCache>,
    deferred: Arc<DeferredService>,
    ops: Arc<dyn OpsSink>,
    run_mode: RunMode,
}

impl UsageRecorder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logs: Arc<dyn UsageLogStore>,
        users: Arc<dyn UserStore>,
        keys: Arc<dyn ApiKeyStore>,
        subs: Arc<dyn SubscriptionStore>,
        auth_cache: Arc<AuthCache>,
        deferred: Arc<DeferredService>,
        ops: Arc<dyn OpsSink>,
        run_mode: RunMode,
    ) -> Self {
        Self {
            logs,
            users,
            keys,
            subs,
            auth_cache,
            deferred,
            ops,
            run_mode,
        }
    }

    /// Record one finished request.
    ///
    /// Never fails the client request: side-effect errors are logged and
    /// swallowed; only a hard failure before the insert could surface, and
    /// even that is logged at the call site.
    pub async fn record(&self, ctx: RecordContext) {
        let snapshot = &ctx.snapshot;
        let multiplier = snapshot.rate_multiplier.unwrap_or(Decimal::ONE);

        let cost = match compute_cost(&ctx.model, &ctx.usage, multiplier) {
            Ok(cost) => cost,
            Err(e) => {
                // Record with zero cost rather than lose the row.
                tracing::warn!(request_id = %ctx.request_id, error = %e, "cost calculation failed");
                CostBreakdown::zero()
            }
        };

        let subscription = if self.run_mode == RunMode::Normal
            && snapshot.subscription_type == SubscriptionType::Subscription
        {
            match snapshot.group_id {
                Some(group_id) => self
                    .subs
                    .bound_subscription(snapshot.user_id, group_id)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "subscription binding lookup failed");
                        None
                    }),
                None => None,
            }
        } else {
            None
        };

        let billing_type = match (self.run_mode, subscription) {
            (RunMode::Simple, _) => BillingType::Unbilled,
            (_, Some(_)) => BillingType::Subscription,
            (_, None) => BillingType::Balance,
        };

        let row = UsageLog {
            request_id: ctx.request_id.clone(),
            user_id: snapshot.user_id,
            api_key_id: snapshot.key_id,
            account_id: ctx.account_id,
            model: ctx.model.clone(),
            usage: ctx.usage,
            input_cost: cost.input,
            output_cost: cost.output,
            cache_create_cost: cost.cache_create,
            cache_read_cost: cost.cache_read,
            total_cost: cost.total,
            actual_cost: cost.actual,
            billing_type,
            stream: ctx.stream,
            duration_ms: ctx.duration_ms,
            first_token_ms: ctx.first_token_ms,
            created_at: Utc::now(),
        };

        // Insert-before-bill: the unique request id is the at-most-once
        // gate. An ambiguous insert error still bills, because the row may
        // have landed.
        let proceed = match self.logs.insert(&row).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(request_id = %ctx.request_id, "duplicate usage row, skipping side-effects");
                false
            }
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, error = %e, "usage insert ambiguous, billing anyway");
                true
            }
        };

        self.deferred.schedule_touch(ctx.account_id);

        if self.run_mode == RunMode::Simple || !proceed {
            return;
        }

        match subscription {
            Some(subscription_id) => {
                if let Err(e) = self.subs.increment_usage(subscription_id, cost.total).await {
                    tracing::warn!(%subscription_id, error = %e, "subscription usage increment failed");
                }
                self.ops
                    .projection(ProjectionEvent::SubscriptionUsage(subscription_id))
                    .await;
            }
            None => {
                if let Err(e) = self
                    .users
                    .deduct_balance(snapshot.user_id, cost.actual)
                    .await
                {
                    tracing::warn!(user_id = %snapshot.user_id, error = %e, "balance deduction failed");
                }
                self.ops
                    .projection(ProjectionEvent::UserBalance(snapshot.user_id))
                    .await;
            }
        }

        self.apply_key_quota(snapshot, cost.actual).await;
    }

    /// Per-key quota: atomic increment, then flip to exhausted and
    /// invalidate the auth cache the moment the limit is crossed.
    async fn apply_key_quota(&self, snapshot: &AuthSnapshot, actual_cost: Decimal) {
        if snapshot.quota_limit <= Decimal::ZERO || actual_cost <= Decimal::ZERO {
            return;
        }
        let new_used = match self
            .keys
            .increment_quota_used(snapshot.key_id, actual_cost)
            .await
        {
            Ok(new_used) => new_used,
            Err(e) => {
                tracing::warn!(key_id = %snapshot.key_id, error = %e, "quota increment failed");
                return;
            }
        };
        if new_used < snapshot.quota_limit {
            return;
        }
        if let Err(e) = self
            .keys
            .set_status(snapshot.key_id, crate::model::KeyStatus::QuotaExhausted)
            .await
        {
            tracing::warn!(key_id = %snapshot.key_id, error = %e, "quota status flip failed");
        }
        // Fail fast on the very next request for this key.
        self.auth_cache.invalidate_hash(&snapshot.key_hash).await;
        tracing::info!(key_id = %snapshot.key_id, "api key quota exhausted");
    }
}
