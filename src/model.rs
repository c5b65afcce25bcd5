//! Core domain types shared across the gateway.
//!
//! `ApiKey` and `User` are the root aggregates in the database; `Account`
//! carries upstream credentials and scheduling state. The scheduler and
//! forwarder only ever see immutable clones loaded through the store layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upstream platform a group or account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Anthropic,
    Openai,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Openai => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Platform::Anthropic),
            "openai" => Some(Platform::Openai),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            _ => None,
        }
    }
}

/// API key usability status. Only `Active` keys serve traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Disabled,
    QuotaExhausted,
    Expired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Disabled => "disabled",
            KeyStatus::QuotaExhausted => "quota_exhausted",
            KeyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(KeyStatus::Active),
            "disabled" => Some(KeyStatus::Disabled),
            "quota_exhausted" => Some(KeyStatus::QuotaExhausted),
            "expired" => Some(KeyStatus::Expired),
            _ => None,
        }
    }
}

/// Credential type of an upstream account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Oauth,
    ApiKey,
}

/// Scheduling state of an upstream account.
///
/// Transitions are driven only by the rate-limit service ingesting upstream
/// responses and by scheduled refreshers; decision sites re-check locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Schedulable,
    RateLimited,
    Overloaded,
    Error,
    Disabled,
}

impl ScheduleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Schedulable => "schedulable",
            ScheduleState::RateLimited => "rate_limited",
            ScheduleState::Overloaded => "overloaded",
            ScheduleState::Error => "error",
            ScheduleState::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedulable" => Some(ScheduleState::Schedulable),
            "rate_limited" => Some(ScheduleState::RateLimited),
            "overloaded" => Some(ScheduleState::Overloaded),
            "error" => Some(ScheduleState::Error),
            "disabled" => Some(ScheduleState::Disabled),
            _ => None,
        }
    }
}

/// Billing posture of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Standard,
    Subscription,
}

/// Gateway owner of an API key.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub status: String,
    pub role: String,
    /// USD balance. Decreases only via atomic deduction in the store layer.
    pub balance: Decimal,
    pub concurrency_limit: u32,
}

/// Routing/billing group an API key may belong to.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub platform: Platform,
    pub status: String,
    /// Cost multiplier applied to billed usage; `None` uses the default.
    pub rate_multiplier: Option<Decimal>,
    pub subscription_type: SubscriptionType,
    pub daily_limit: Option<Decimal>,
    pub weekly_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    /// Model-routing map: pattern -> allowed account ids. Consulted only
    /// when `routing_enabled`.
    pub model_routing: HashMap<String, Vec<Uuid>>,
    pub routing_enabled: bool,
    pub claude_code_only: bool,
    pub fallback_group_id: Option<Uuid>,
}

/// A client-facing API key.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    /// The opaque secret presented by clients. Never logged; cache keys use
    /// its SHA-256 hash.
    pub secret: SecretString,
    pub name: String,
    pub group_id: Option<Uuid>,
    pub status: KeyStatus,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    /// USD quota. Zero means unlimited.
    pub quota_limit: Decimal,
    /// Monotonically non-decreasing spend against `quota_limit`.
    pub quota_used: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Opaque upstream credentials for an account.
#[derive(Debug, Clone, Default)]
pub struct AccountCredentials {
    pub api_key: Option<SecretString>,
    pub access_token: Option<SecretString>,
    /// ChatGPT account id for OAuth Codex accounts.
    pub account_id: Option<String>,
}

/// Per-status passthrough rule from an account's custom error-code map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRule {
    /// `passthrough` surfaces the upstream status + mapped message verbatim.
    pub passthrough: bool,
    pub kind: Option<String>,
    pub message: Option<String>,
}

/// An upstream account in the pool.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub platform: Platform,
    pub kind: AccountKind,
    pub credentials: AccountCredentials,
    /// Smaller is preferred.
    pub priority: i32,
    pub max_concurrency: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub schedule_state: ScheduleState,
    /// Per-model rate-limit expirations.
    pub model_rate_limits: HashMap<String, DateTime<Utc>>,
    /// Per-quota-scope rate-limit expirations (e.g. "claude", "gemini_text").
    pub scope_rate_limits: HashMap<String, DateTime<Utc>>,
    /// Requested model -> upstream model.
    pub model_mapping: HashMap<String, String>,
    /// Supported models; empty means all models.
    pub supported_models: Vec<String>,
    /// Whether the account can serve extended-thinking requests.
    pub supports_thinking: bool,
    /// Custom error-code handling map, keyed by upstream HTTP status.
    pub error_rules: HashMap<u16, ErrorRule>,
    /// Account-scoped upstream base URL (API-key accounts).
    pub base_url: Option<String>,
    /// Optional egress proxy URL for this account.
    pub proxy_url: Option<String>,
    /// Forward bodies/headers verbatim when set.
    pub passthrough: bool,
    /// Opaque extra state merged key-wise by `update_extra`.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Account {
    /// Whether the account may serve `model` right now.
    ///
    /// Re-checked at decision time because scheduler snapshots may be stale.
    pub fn is_schedulable_for(&self, model: &str, now: DateTime<Utc>) -> bool {
        if self.schedule_state != ScheduleState::Schedulable {
            return false;
        }
        if let Some(until) = self.model_rate_limits.get(model) {
            if *until > now {
                return false;
            }
        }
        self.supports_model(model)
    }

    /// Whether `model` is in the account's supported set (empty = all).
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty()
            || self.supported_models.iter().any(|m| m == model)
            || self.model_mapping.contains_key(model)
    }

    /// Upstream model after applying the account's mapping.
    pub fn map_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }
}

/// Token counts observed for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }

    /// Input tokens actually charged at the input rate: cache reads are
    /// billed separately, floored at zero.
    pub fn actual_input(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cache_read_tokens)
    }
}

/// How a request was billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    Balance,
    Subscription,
    /// Simple run mode: observed, not billed.
    Unbilled,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::Balance => "balance",
            BillingType::Subscription => "subscription",
            BillingType::Unbilled => "unbilled",
        }
    }
}

/// One durable usage row. Inserted at most once per `request_id`.
#[derive(Debug, Clone)]
pub struct UsageLog {
    pub request_id: String,
    pub user_id: Uuid,
    pub api_key_id: Uuid,
    pub account_id: Uuid,
    pub model: String,
    pub usage: Usage,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_create_cost: Decimal,
    pub cache_read_cost: Decimal,
    pub total_cost: Decimal,
    pub actual_cost: Decimal,
    pub billing_type: BillingType,
    pub stream: bool,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}
