//! In-memory store backend.
//!
//! Backs tests and single-node demo deployments. All traits are
//! implemented over one mutex-guarded state block; no operation holds the
//! lock across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::auth::snapshot::sha256_hex;

use crate::error::StoreError;
use crate::model::{Account, ApiKey, Group, KeyStatus, Platform, ScheduleState, UsageLog, User};
use crate::store::{
    ApiKeyStore, AccountStore, AuthBundle, SubscriptionStore, UsageLogStore, UserStore,
};

#[derive(Default)]
struct State {
    keys: HashMap<Uuid, ApiKey>,
    users: HashMap<Uuid, User>,
    groups: HashMap<Uuid, Group>,
    accounts: HashMap<Uuid, Account>,
    usage_logs: HashMap<String, UsageLog>,
    subscription_bindings: HashMap<(Uuid, Uuid), Uuid>,
    subscription_usage: HashMap<Uuid, Decimal>,
    /// Counts repository auth loads, for single-flight assertions.
    auth_load_calls: u64,
}

/// In-memory backend implementing every store trait.
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, user: User) {
        self.lock().users.insert(user.id, user);
    }

    pub fn add_group(&self, group: Group) {
        self.lock().groups.insert(group.id, group);
    }

    pub fn add_key(&self, key: ApiKey) {
        self.lock().keys.insert(key.id, key);
    }

    pub fn add_account(&self, account: Account) {
        self.lock().accounts.insert(account.id, account);
    }

    pub fn bind_subscription(&self, user_id: Uuid, group_id: Uuid, subscription_id: Uuid) {
        self.lock()
            .subscription_bindings
            .insert((user_id, group_id), subscription_id);
    }

    // ---- test observation helpers ----

    pub fn auth_load_calls(&self) -> u64 {
        self.lock().auth_load_calls
    }

    pub fn balance_of(&self, user_id: Uuid) -> Option<Decimal> {
        self.lock().users.get(&user_id).map(|u| u.balance)
    }

    pub fn key_of(&self, key_id: Uuid) -> Option<ApiKey> {
        self.lock().keys.get(&key_id).cloned()
    }

    pub fn account_of(&self, account_id: Uuid) -> Option<Account> {
        self.lock().accounts.get(&account_id).cloned()
    }

    pub fn usage_log(&self, request_id: &str) -> Option<UsageLog> {
        self.lock().usage_logs.get(request_id).cloned()
    }

    pub fn usage_log_count(&self) -> usize {
        self.lock().usage_logs.len()
    }

    pub fn subscription_usage_of(&self, subscription_id: Uuid) -> Decimal {
        self.lock()
            .subscription_usage
            .get(&subscription_id)
            .copied()
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn get_by_secret_for_auth(&self, secret: &str) -> Result<Option<AuthBundle>, StoreError> {
        let mut state = self.lock();
        state.auth_load_calls += 1;

        let Some(key) = state
            .keys
            .values()
            .find(|k| k.secret.expose_secret() == secret)
            .cloned()
        else {
            return Ok(None);
        };

        let user = state
            .users
            .get(&key.user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "user".to_string(),
                id: key.user_id.to_string(),
            })?;
        let group = key.group_id.and_then(|gid| state.groups.get(&gid).cloned());

        Ok(Some(AuthBundle { key, user, group }))
    }

    async fn list_key_hashes_by_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(state
            .keys
            .values()
            .filter(|k| k.user_id == user_id)
            .map(|k| sha256_hex(k.secret.expose_secret()))
            .collect())
    }

    async fn list_key_hashes_by_group(&self, group_id: Uuid) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(state
            .keys
            .values()
            .filter(|k| k.group_id == Some(group_id))
            .map(|k| sha256_hex(k.secret.expose_secret()))
            .collect())
    }

    async fn increment_quota_used(
        &self,
        key_id: Uuid,
        delta: Decimal,
    ) -> Result<Decimal, StoreError> {
        let mut state = self.lock();
        let key = state.keys.get_mut(&key_id).ok_or_else(|| StoreError::NotFound {
            entity: "api_key".to_string(),
            id: key_id.to_string(),
        })?;
        key.quota_used += delta;
        Ok(key.quota_used)
    }

    async fn set_status(&self, key_id: Uuid, status: KeyStatus) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = state.keys.get_mut(&key_id).ok_or_else(|| StoreError::NotFound {
            entity: "api_key".to_string(),
            id: key_id.to_string(),
        })?;
        key.status = status;
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn deduct_balance(&self, user_id: Uuid, amount: Decimal) -> Result<(), StoreError> {
        let mut state = self.lock();
        let user = state.users.get_mut(&user_id).ok_or_else(|| StoreError::NotFound {
            entity: "user".to_string(),
            id: user_id.to_string(),
        })?;
        user.balance -= amount;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.lock().accounts.get(&id).cloned())
    }

    async fn list_schedulable(&self, platform: Platform) -> Result<Vec<Account>, StoreError> {
        let state = self.lock();
        Ok(state
            .accounts
            .values()
            .filter(|a| a.platform == platform && a.schedule_state == ScheduleState::Schedulable)
            .cloned()
            .collect())
    }

    async fn update_schedule_state(
        &self,
        id: Uuid,
        state: ScheduleState,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let account = guard.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "account".to_string(),
            id: id.to_string(),
        })?;
        account.schedule_state = state;
        Ok(())
    }

    async fn set_model_rate_limit(
        &self,
        id: Uuid,
        model: &str,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let account = guard.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "account".to_string(),
            id: id.to_string(),
        })?;
        account.model_rate_limits.insert(model.to_string(), until);
        Ok(())
    }

    async fn update_extra(
        &self,
        id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        let account = guard.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "account".to_string(),
            id: id.to_string(),
        })?;
        for (k, v) in patch {
            account.extra.insert(k, v);
        }
        Ok(())
    }

    async fn touch_last_used(
        &self,
        touches: &[(Uuid, DateTime<Utc>)],
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        for (id, at) in touches {
            if let Some(account) = guard.accounts.get_mut(id) {
                account.last_used_at = Some(*at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UsageLogStore for MemoryStore {
    async fn insert(&self, log: &UsageLog) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.usage_logs.contains_key(&log.request_id) {
            return Ok(false);
        }
        state.usage_logs.insert(log.request_id.clone(), log.clone());
        Ok(true)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn bound_subscription(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .lock()
            .subscription_bindings
            .get(&(user_id, group_id))
            .copied())
    }

    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        *state
            .subscription_usage
            .entry(subscription_id)
            .or_default() += amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccountCredentials;
    use rust_decimal_macros::dec;
    use secrecy::SecretString;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            status: "active".into(),
            role: "user".into(),
            balance: dec!(10),
            concurrency_limit: 10,
        }
    }

    fn key_for(user_id: Uuid, secret: &str) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            user_id,
            secret: SecretString::from(secret.to_string()),
            name: "test".into(),
            group_id: None,
            status: KeyStatus::Active,
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            quota_limit: Decimal::ZERO,
            quota_used: Decimal::ZERO,
            expires_at: None,
        }
    }

    fn usage_log(request_id: &str) -> UsageLog {
        UsageLog {
            request_id: request_id.to_string(),
            user_id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            model: "gpt-5-codex".into(),
            usage: Default::default(),
            input_cost: Decimal::ZERO,
            output_cost: Decimal::ZERO,
            cache_create_cost: Decimal::ZERO,
            cache_read_cost: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            actual_cost: Decimal::ZERO,
            billing_type: crate::model::BillingType::Balance,
            stream: false,
            duration_ms: 10,
            first_token_ms: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn auth_lookup_joins_user() {
        let store = MemoryStore::new();
        let u = user();
        let user_id = u.id;
        store.add_user(u);
        store.add_key(key_for(user_id, "sk-test-1"));

        let bundle = store
            .get_by_secret_for_auth("sk-test-1")
            .await
            .unwrap()
            .expect("bundle");
        assert_eq!(bundle.user.id, user_id);
        assert!(bundle.group.is_none());

        assert!(store.get_by_secret_for_auth("sk-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_log_insert_is_idempotent() {
        let store = MemoryStore::new();
        let log = usage_log("req-1");
        assert!(store.insert(&log).await.unwrap());
        assert!(!store.insert(&log).await.unwrap());
        assert_eq!(store.usage_log_count(), 1);
    }

    #[tokio::test]
    async fn quota_increment_returns_new_value() {
        let store = MemoryStore::new();
        let u = user();
        let user_id = u.id;
        store.add_user(u);
        let mut key = key_for(user_id, "sk-q");
        key.quota_used = dec!(0.99);
        let key_id = key.id;
        store.add_key(key);

        let new_value = store
            .increment_quota_used(key_id, dec!(0.02))
            .await
            .unwrap();
        assert_eq!(new_value, dec!(1.01));
    }

    #[tokio::test]
    async fn balance_deduction_is_cumulative() {
        let store = MemoryStore::new();
        let u = user();
        let user_id = u.id;
        store.add_user(u);

        store.deduct_balance(user_id, dec!(1.5)).await.unwrap();
        store.deduct_balance(user_id, dec!(0.5)).await.unwrap();
        assert_eq!(store.balance_of(user_id), Some(dec!(8)));
    }

    #[tokio::test]
    async fn extra_map_merges_keywise() {
        let store = MemoryStore::new();
        let account = Account {
            id: Uuid::new_v4(),
            name: "a".into(),
            platform: Platform::Openai,
            kind: crate::model::AccountKind::Oauth,
            credentials: AccountCredentials::default(),
            priority: 1,
            max_concurrency: 1,
            last_used_at: None,
            schedule_state: ScheduleState::Schedulable,
            model_rate_limits: HashMap::new(),
            scope_rate_limits: HashMap::new(),
            model_mapping: HashMap::new(),
            supported_models: Vec::new(),
            supports_thinking: true,
            error_rules: HashMap::new(),
            base_url: None,
            proxy_url: None,
            passthrough: false,
            extra: serde_json::Map::new(),
        };
        let id = account.id;
        store.add_account(account);

        let mut patch = serde_json::Map::new();
        patch.insert("a".into(), serde_json::json!(1));
        store.update_extra(id, patch).await.unwrap();

        let mut patch = serde_json::Map::new();
        patch.insert("b".into(), serde_json::json!(2));
        store.update_extra(id, patch).await.unwrap();

        let account = store.account_of(id).unwrap();
        assert_eq!(account.extra.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(account.extra.get("b"), Some(&serde_json::json!(2)));
    }
}
