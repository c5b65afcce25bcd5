//! Frozen auth snapshot.
//!
//! A minimal immutable projection of ApiKey + User + Group covering only
//! what auth checks, the scheduler, and the usage recorder read. Kept
//! intentionally small so the cache stays cheap to serialize; promoting a
//! field here requires a schema bump plus full invalidation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::{ApiKey, KeyStatus, Platform, SubscriptionType};
use crate::store::AuthBundle;

/// Bump when snapshot fields change; mismatched cached entries are
/// discarded on read.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 3;

/// Immutable auth projection cached per API key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSnapshot {
    pub schema_version: u32,

    pub key_id: Uuid,
    /// SHA-256 hex of the key secret; doubles as the cache key.
    pub key_hash: String,
    pub key_name: String,
    pub key_status: KeyStatus,
    pub user_id: Uuid,
    pub group_id: Option<Uuid>,

    pub quota_limit: Decimal,
    pub quota_used: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,

    pub user_status: String,
    pub user_concurrency_limit: u32,

    /// Platform of the key's group; `None` when the key has no group.
    pub platform: Option<Platform>,
    pub rate_multiplier: Option<Decimal>,
    pub subscription_type: SubscriptionType,
    pub model_routing: HashMap<String, Vec<Uuid>>,
    pub routing_enabled: bool,
    pub claude_code_only: bool,
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl AuthSnapshot {
    /// Build a snapshot from a freshly loaded bundle.
    pub fn from_bundle(bundle: &AuthBundle) -> Self {
        let key = &bundle.key;
        let group = bundle.group.as_ref();
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            key_id: key.id,
            key_hash: sha256_hex(key.secret.expose_secret()),
            key_name: key.name.clone(),
            key_status: key.status,
            user_id: key.user_id,
            group_id: key.group_id,
            quota_limit: key.quota_limit,
            quota_used: key.quota_used,
            expires_at: key.expires_at,
            ip_whitelist: key.ip_whitelist.clone(),
            ip_blacklist: key.ip_blacklist.clone(),
            user_status: bundle.user.status.clone(),
            user_concurrency_limit: bundle.user.concurrency_limit,
            platform: group.map(|g| g.platform),
            rate_multiplier: group.and_then(|g| g.rate_multiplier),
            subscription_type: group
                .map(|g| g.subscription_type)
                .unwrap_or(SubscriptionType::Standard),
            model_routing: group.map(|g| g.model_routing.clone()).unwrap_or_default(),
            routing_enabled: group.map(|g| g.routing_enabled).unwrap_or(false),
            claude_code_only: group.map(|g| g.claude_code_only).unwrap_or(false),
        }
    }

    /// Rebuild an `ApiKey` carrying every field the scheduler reads.
    ///
    /// The raw secret is supplied by the caller; the snapshot only ever
    /// holds its hash.
    pub fn to_api_key(&self, secret: SecretString) -> ApiKey {
        ApiKey {
            id: self.key_id,
            user_id: self.user_id,
            secret,
            name: self.key_name.clone(),
            group_id: self.group_id,
            status: self.key_status,
            ip_whitelist: self.ip_whitelist.clone(),
            ip_blacklist: self.ip_blacklist.clone(),
            quota_limit: self.quota_limit,
            quota_used: self.quota_used,
            expires_at: self.expires_at,
        }
    }

    /// Model-routing restriction for `model`, when routing is enabled and a
    /// pattern matches. Patterns support a trailing `*` wildcard.
    pub fn routed_accounts(&self, model: &str) -> Option<&[Uuid]> {
        if !self.routing_enabled {
            return None;
        }
        // Exact patterns win over wildcards.
        if let Some(ids) = self.model_routing.get(model) {
            return Some(ids);
        }
        self.model_routing
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, model))
            .map(|(_, ids)| ids.as_slice())
    }
}

fn pattern_matches(pattern: &str, model: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => model.starts_with(prefix),
        None => pattern == model,
    }
}
