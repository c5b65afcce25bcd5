//! Repository contracts for the gateway.
//!
//! The hot path only ever talks to these traits. [`memory::MemoryStore`]
//! backs tests and single-node demos; [`postgres::PgStore`] is the
//! production backend and implements exactly the statements the hot path
//! needs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Account, ApiKey, Group, KeyStatus, Platform, ScheduleState, UsageLog, User};

/// Everything the auth snapshot is built from, loaded in one repository
/// round-trip.
#[derive(Debug, Clone)]
pub struct AuthBundle {
    pub key: ApiKey,
    pub user: User,
    pub group: Option<Group>,
}

/// API key repository.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Load the key plus its owner and group by the opaque secret. `None`
    /// when no such key exists.
    async fn get_by_secret_for_auth(&self, secret: &str) -> Result<Option<AuthBundle>, StoreError>;

    /// SHA-256 hex hashes of every key secret owned by the user. Used to
    /// fan out cache invalidations.
    async fn list_key_hashes_by_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// SHA-256 hex hashes of every key secret in the group.
    async fn list_key_hashes_by_group(&self, group_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// Atomically add `delta` to `quota_used`, returning the new value.
    async fn increment_quota_used(&self, key_id: Uuid, delta: Decimal)
    -> Result<Decimal, StoreError>;

    async fn set_status(&self, key_id: Uuid, status: KeyStatus) -> Result<(), StoreError>;
}

/// User repository. Balance moves only through atomic deduction.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn deduct_balance(&self, user_id: Uuid, amount: Decimal) -> Result<(), StoreError>;
}

/// Upstream account repository.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Accounts currently marked schedulable for the platform. The result
    /// is advisory; decision sites re-check schedulability.
    async fn list_schedulable(&self, platform: Platform) -> Result<Vec<Account>, StoreError>;

    async fn update_schedule_state(
        &self,
        id: Uuid,
        state: ScheduleState,
    ) -> Result<(), StoreError>;

    /// Record a per-model rate-limit expiry for the account.
    async fn set_model_rate_limit(
        &self,
        id: Uuid,
        model: &str,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Merge `patch` key-wise into the account's opaque extra map.
    async fn update_extra(
        &self,
        id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Batched `last_used_at` updates from the deferred scheduler.
    async fn touch_last_used(
        &self,
        touches: &[(Uuid, DateTime<Utc>)],
    ) -> Result<(), StoreError>;
}

/// Usage log repository.
#[async_trait]
pub trait UsageLogStore: Send + Sync {
    /// Insert the row. Returns `true` only when no row for the request id
    /// existed before (the at-most-once gate for billing side-effects).
    async fn insert(&self, log: &UsageLog) -> Result<bool, StoreError>;
}

/// Subscription repository.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The subscription bound to (user, group), if any.
    async fn bound_subscription(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        amount: Decimal,
    ) -> Result<(), StoreError>;
}

/// Dashboard projection refresh requests emitted by the usage recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionEvent {
    UserBalance(Uuid),
    SubscriptionUsage(Uuid),
}

/// A request-level error worth surfacing to operators.
#[derive(Debug, Clone)]
pub struct RequestErrorEvent {
    pub request_id: String,
    pub account_id: Option<Uuid>,
    pub status: u16,
    /// Sanitized message; must never contain credentials.
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Operator-facing event sink. Dashboard aggregation is the external
/// collaborator behind this seam.
#[async_trait]
pub trait OpsSink: Send + Sync {
    async fn request_error(&self, event: RequestErrorEvent);

    async fn projection(&self, event: ProjectionEvent);
}

/// [`OpsSink`] that emits structured log lines.
pub struct LogOpsSink;

#[async_trait]
impl OpsSink for LogOpsSink {
    async fn request_error(&self, event: RequestErrorEvent) {
        tracing::warn!(
            request_id = %event.request_id,
            account_id = ?event.account_id,
            status = event.status,
            message = %event.message,
            "upstream request error"
        );
    }

    async fn projection(&self, event: ProjectionEvent) {
        tracing::debug!(event = ?event, "projection refresh enqueued");
    }
}
