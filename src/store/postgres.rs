//! PostgreSQL store backend.
//!
//! Implements exactly the statements the request hot path needs. Schema
//! contracts: `usage_logs` carries a unique index on `request_id`,
//! `api_keys.quota_used` moves via atomic increment returning the new
//! value, and `accounts.extra` is an opaque JSONB map merged key-wise.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::model::{
    Account, AccountCredentials, AccountKind, ApiKey, ErrorRule, Group, KeyStatus, Platform,
    ScheduleState, SubscriptionType, UsageLog, User,
};
use crate::auth::snapshot::sha256_hex;
use crate::store::{
    ApiKeyStore, AccountStore, AuthBundle, SubscriptionStore, UsageLogStore, UserStore,
};

/// PostgreSQL backend for the store traits.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(config.url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }
}

fn row_to_user(row: &Row, prefix: &str) -> User {
    User {
        id: row.get(format!("{prefix}id").as_str()),
        status: row.get(format!("{prefix}status").as_str()),
        role: row.get(format!("{prefix}role").as_str()),
        balance: row.get(format!("{prefix}balance").as_str()),
        concurrency_limit: row.get::<_, i32>(format!("{prefix}concurrency_limit").as_str()) as u32,
    }
}

fn json_map(value: Option<serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    match value {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn string_map(value: Option<serde_json::Value>) -> HashMap<String, String> {
    json_map(value)
        .into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect()
}

fn timestamp_map(value: Option<serde_json::Value>) -> HashMap<String, DateTime<Utc>> {
    json_map(value)
        .into_iter()
        .filter_map(|(k, v)| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| (k, ts.with_timezone(&Utc)))
        })
        .collect()
}

fn row_to_key(row: &Row) -> Result<ApiKey, StoreError> {
    let status: String = row.get("status");
    Ok(ApiKey {
        id: row.get("id"),
        user_id: row.get("user_id"),
        secret: SecretString::from(row.get::<_, String>("secret")),
        name: row.get("name"),
        group_id: row.get("group_id"),
        status: KeyStatus::parse(&status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown api key status '{status}'"))
        })?,
        ip_whitelist: row.get::<_, Option<Vec<String>>>("ip_whitelist").unwrap_or_default(),
        ip_blacklist: row.get::<_, Option<Vec<String>>>("ip_blacklist").unwrap_or_default(),
        quota_limit: row.get("quota_limit"),
        quota_used: row.get("quota_used"),
        expires_at: row.get("expires_at"),
    })
}

fn row_to_group(row: &Row) -> Result<Option<Group>, StoreError> {
    let id: Option<Uuid> = row.get("g_id");
    let Some(id) = id else { return Ok(None) };

    let platform: String = row.get("g_platform");
    let subscription_type: String = row.get("g_subscription_type");
    let routing = json_map(row.get("g_model_routing"))
        .into_iter()
        .filter_map(|(pattern, v)| {
            let ids = v
                .as_array()?
                .iter()
                .filter_map(|id| id.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect();
            Some((pattern, ids))
        })
        .collect();

    Ok(Some(Group {
        id,
        name: row.get("g_name"),
        platform: Platform::parse(&platform).ok_or_else(|| {
            StoreError::Serialization(format!("unknown platform '{platform}'"))
        })?,
        status: row.get("g_status"),
        rate_multiplier: row.get("g_rate_multiplier"),
        subscription_type: match subscription_type.as_str() {
            "subscription" => SubscriptionType::Subscription,
            _ => SubscriptionType::Standard,
        },
        daily_limit: row.get("g_daily_limit"),
        weekly_limit: row.get("g_weekly_limit"),
        monthly_limit: row.get("g_monthly_limit"),
        model_routing: routing,
        routing_enabled: row.get("g_routing_enabled"),
        claude_code_only: row.get("g_claude_code_only"),
        fallback_group_id: row.get("g_fallback_group_id"),
    }))
}

fn row_to_account(row: &Row) -> Result<Account, StoreError> {
    let platform: String = row.get("platform");
    let kind: String = row.get("kind");
    let state: String = row.get("schedule_state");
    let credentials = json_map(row.get("credentials"));

    let error_rules = json_map(row.get("error_rules"))
        .into_iter()
        .filter_map(|(code, v)| {
            let code: u16 = code.parse().ok()?;
            let rule: ErrorRule = serde_json::from_value(v).ok()?;
            Some((code, rule))
        })
        .collect();

    let supported_models = row
        .get::<_, Option<serde_json::Value>>("supported_models")
        .and_then(|v| {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|m| m.as_str().map(String::from))
                    .collect()
            })
        })
        .unwrap_or_default();

    Ok(Account {
        id: row.get("id"),
        name: row.get("name"),
        platform: Platform::parse(&platform).ok_or_else(|| {
            StoreError::Serialization(format!("unknown platform '{platform}'"))
        })?,
        kind: match kind.as_str() {
            "oauth" => AccountKind::Oauth,
            _ => AccountKind::ApiKey,
        },
        credentials: AccountCredentials {
            api_key: credentials
                .get("api_key")
                .and_then(|v| v.as_str())
                .map(|s| SecretString::from(s.to_string())),
            access_token: credentials
                .get("access_token")
                .and_then(|v| v.as_str())
                .map(|s| SecretString::from(s.to_string())),
            account_id: credentials
                .get("account_id")
                .and_then(|v| v.as_str())
                .map(String::from),
        },
        priority: row.get("priority"),
        max_concurrency: row.get::<_, i32>("max_concurrency") as u32,
        last_used_at: row.get("last_used_at"),
        schedule_state: ScheduleState::parse(&state).ok_or_else(|| {
            StoreError::Serialization(format!("unknown schedule state '{state}'"))
        })?,
        model_rate_limits: timestamp_map(row.get("model_rate_limits")),
        scope_rate_limits: timestamp_map(row.get("scope_rate_limits")),
        model_mapping: string_map(row.get("model_mapping")),
        supported_models,
        supports_thinking: row.get("supports_thinking"),
        error_rules,
        base_url: row.get("base_url"),
        proxy_url: row.get("proxy_url"),
        passthrough: row.get("passthrough"),
        extra: json_map(row.get("extra")),
    })
}

const ACCOUNT_COLUMNS: &str = "id, name, platform, kind, credentials, priority, max_concurrency, \
     last_used_at, schedule_state, model_rate_limits, scope_rate_limits, model_mapping, \
     supported_models, supports_thinking, error_rules, base_url, proxy_url, passthrough, extra";

#[async_trait]
impl ApiKeyStore for PgStore {
    async fn get_by_secret_for_auth(&self, secret: &str) -> Result<Option<AuthBundle>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT k.id, k.user_id, k.secret, k.name, k.group_id, k.status,
                       k.ip_whitelist, k.ip_blacklist, k.quota_limit, k.quota_used, k.expires_at,
                       u.id AS u_id, u.status AS u_status, u.role AS u_role,
                       u.balance AS u_balance, u.concurrency_limit AS u_concurrency_limit,
                       g.id AS g_id, g.name AS g_name, g.platform AS g_platform,
                       g.status AS g_status, g.rate_multiplier AS g_rate_multiplier,
                       g.subscription_type AS g_subscription_type,
                       g.daily_limit AS g_daily_limit, g.weekly_limit AS g_weekly_limit,
                       g.monthly_limit AS g_monthly_limit,
                       g.model_routing AS g_model_routing,
                       g.routing_enabled AS g_routing_enabled,
                       g.claude_code_only AS g_claude_code_only,
                       g.fallback_group_id AS g_fallback_group_id
                FROM api_keys k
                JOIN users u ON u.id = k.user_id
                LEFT JOIN groups g ON g.id = k.group_id
                WHERE k.secret = $1
                "#,
                &[&secret],
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(AuthBundle {
            key: row_to_key(&row)?,
            user: row_to_user(&row, "u_"),
            group: row_to_group(&row)?,
        }))
    }

    async fn list_key_hashes_by_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query("SELECT secret FROM api_keys WHERE user_id = $1", &[&user_id])
            .await?;
        Ok(rows
            .iter()
            .map(|r| sha256_hex(r.get::<_, &str>("secret")))
            .collect())
    }

    async fn list_key_hashes_by_group(&self, group_id: Uuid) -> Result<Vec<String>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT secret FROM api_keys WHERE group_id = $1",
                &[&group_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| sha256_hex(r.get::<_, &str>("secret")))
            .collect())
    }

    async fn increment_quota_used(
        &self,
        key_id: Uuid,
        delta: Decimal,
    ) -> Result<Decimal, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "UPDATE api_keys SET quota_used = quota_used + $2 WHERE id = $1 RETURNING quota_used",
                &[&key_id, &delta],
            )
            .await?;
        Ok(row.get("quota_used"))
    }

    async fn set_status(&self, key_id: Uuid, status: KeyStatus) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE api_keys SET status = $2 WHERE id = $1",
            &[&key_id, &status.as_str()],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, status, role, balance, concurrency_limit FROM users WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.map(|r| row_to_user(&r, "")))
    }

    async fn deduct_balance(&self, user_id: Uuid, amount: Decimal) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET balance = balance - $2 WHERE id = $1",
            &[&user_id, &amount],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.map(|r| row_to_account(&r)).transpose()
    }

    async fn list_schedulable(&self, platform: Platform) -> Result<Vec<Account>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts \
                     WHERE platform = $1 AND schedule_state = 'schedulable'"
                ),
                &[&platform.as_str()],
            )
            .await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn update_schedule_state(
        &self,
        id: Uuid,
        state: ScheduleState,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE accounts SET schedule_state = $2 WHERE id = $1",
            &[&id, &state.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn set_model_rate_limit(
        &self,
        id: Uuid,
        model: &str,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let patch = serde_json::json!({ model: until.to_rfc3339() });
        conn.execute(
            "UPDATE accounts SET model_rate_limits = COALESCE(model_rate_limits, '{}'::jsonb) || $2 \
             WHERE id = $1",
            &[&id, &patch],
        )
        .await?;
        Ok(())
    }

    async fn update_extra(
        &self,
        id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let patch = serde_json::Value::Object(patch);
        conn.execute(
            "UPDATE accounts SET extra = COALESCE(extra, '{}'::jsonb) || $2 WHERE id = $1",
            &[&id, &patch],
        )
        .await?;
        Ok(())
    }

    async fn touch_last_used(
        &self,
        touches: &[(Uuid, DateTime<Utc>)],
    ) -> Result<(), StoreError> {
        if touches.is_empty() {
            return Ok(());
        }
        let conn = self.conn().await?;
        let stmt = conn
            .prepare("UPDATE accounts SET last_used_at = $2 WHERE id = $1")
            .await?;
        for (id, at) in touches {
            conn.execute(&stmt, &[id, at]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UsageLogStore for PgStore {
    async fn insert(&self, log: &UsageLog) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO usage_logs (
                    request_id, user_id, api_key_id, account_id, model,
                    input_tokens, output_tokens, cache_create_tokens, cache_read_tokens,
                    input_cost, output_cost, cache_create_cost, cache_read_cost,
                    total_cost, actual_cost, billing_type, stream,
                    duration_ms, first_token_ms, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                          $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                ON CONFLICT (request_id) DO NOTHING
                "#,
                &[
                    &log.request_id,
                    &log.user_id,
                    &log.api_key_id,
                    &log.account_id,
                    &log.model,
                    &(log.usage.input_tokens as i64),
                    &(log.usage.output_tokens as i64),
                    &(log.usage.cache_creation_tokens as i64),
                    &(log.usage.cache_read_tokens as i64),
                    &log.input_cost,
                    &log.output_cost,
                    &log.cache_create_cost,
                    &log.cache_read_cost,
                    &log.total_cost,
                    &log.actual_cost,
                    &log.billing_type.as_str(),
                    &log.stream,
                    &(log.duration_ms as i64),
                    &log.first_token_ms.map(|v| v as i64),
                    &log.created_at,
                ],
            )
            .await?;
        Ok(inserted == 1)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn bound_subscription(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT subscription_id FROM subscription_bindings \
                 WHERE user_id = $1 AND group_id = $2",
                &[&user_id, &group_id],
            )
            .await?;
        Ok(row.map(|r| r.get("subscription_id")))
    }

    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE subscriptions SET used = used + $2 WHERE id = $1",
            &[&subscription_id, &amount],
        )
        .await?;
        Ok(())
    }
}
