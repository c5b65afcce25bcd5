//! API-key authentication: the snapshot model, the two-tier cache, and the
//! request-time authorization checks layered on a snapshot.

pub mod cache;
pub mod snapshot;

pub use cache::{AuthCache, INVALIDATION_CHANNEL};
pub use snapshot::{AuthSnapshot, SNAPSHOT_SCHEMA_VERSION};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::AuthError;
use crate::model::KeyStatus;

/// What kind of client is on the other end, as far as auth cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    CodexCli,
    ClaudeCode,
    Other,
}

impl ClientKind {
    /// Classify by user agent. `force_codex_cli` makes every client
    /// present as Codex-CLI upstream.
    pub fn from_user_agent(user_agent: Option<&str>, force_codex_cli: bool) -> Self {
        if force_codex_cli {
            return ClientKind::CodexCli;
        }
        match user_agent {
            Some(ua) if ua.starts_with("codex_cli_rs") || ua.starts_with("codex_vscode") => {
                ClientKind::CodexCli
            }
            Some(ua) if ua.contains("claude-cli") || ua.contains("ClaudeCode") => {
                ClientKind::ClaudeCode
            }
            _ => ClientKind::Other,
        }
    }
}

/// Request-time checks on a cached snapshot.
///
/// The snapshot may be slightly stale (up to the L1 TTL); the usage
/// recorder closes the gap by invalidating the cache the moment a key
/// crosses its quota.
pub fn authorize(
    snapshot: &AuthSnapshot,
    client_ip: &str,
    client: ClientKind,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    match snapshot.key_status {
        KeyStatus::Active => {}
        KeyStatus::Disabled => return Err(AuthError::KeyDisabled),
        KeyStatus::QuotaExhausted => return Err(AuthError::QuotaExhausted),
        KeyStatus::Expired => return Err(AuthError::KeyExpired),
    }

    if let Some(expires_at) = snapshot.expires_at {
        if expires_at <= now {
            return Err(AuthError::KeyExpired);
        }
    }

    if snapshot.quota_limit > Decimal::ZERO && snapshot.quota_used >= snapshot.quota_limit {
        return Err(AuthError::QuotaExhausted);
    }

    if !ip_allowed(client_ip, &snapshot.ip_whitelist, &snapshot.ip_blacklist) {
        return Err(AuthError::IpNotAllowed {
            ip: client_ip.to_string(),
        });
    }

    if snapshot.claude_code_only && client != ClientKind::ClaudeCode {
        return Err(AuthError::ClientNotAllowed);
    }

    Ok(())
}

/// Blacklist wins over whitelist; an empty whitelist allows any IP.
/// Entries are exact addresses or prefix patterns with a trailing `*`.
fn ip_allowed(ip: &str, whitelist: &[String], blacklist: &[String]) -> bool {
    let matches = |pattern: &String| match pattern.strip_suffix('*') {
        Some(prefix) => ip.starts_with(prefix),
        None => pattern == ip,
    };
    if blacklist.iter().any(matches) {
        return false;
    }
    whitelist.is_empty() || whitelist.iter().any(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiKey, User};
    use crate::store::AuthBundle;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use secrecy::SecretString;
    use uuid::Uuid;

    fn snapshot() -> AuthSnapshot {
        let user_id = Uuid::new_v4();
        AuthSnapshot::from_bundle(&AuthBundle {
            key: ApiKey {
                id: Uuid::new_v4(),
                user_id,
                secret: SecretString::from("sk-auth-check"),
                name: "t".into(),
                group_id: None,
                status: KeyStatus::Active,
                ip_whitelist: Vec::new(),
                ip_blacklist: Vec::new(),
                quota_limit: Decimal::ZERO,
                quota_used: Decimal::ZERO,
                expires_at: None,
            },
            user: User {
                id: user_id,
                status: "active".into(),
                role: "user".into(),
                balance: dec!(1),
                concurrency_limit: 1,
            },
            group: None,
        })
    }

    #[test]
    fn active_key_authorizes() {
        let snap = snapshot();
        assert!(authorize(&snap, "1.2.3.4", ClientKind::Other, Utc::now()).is_ok());
    }

    #[test]
    fn disabled_and_exhausted_statuses_fail() {
        let mut snap = snapshot();
        snap.key_status = KeyStatus::Disabled;
        assert!(matches!(
            authorize(&snap, "1.2.3.4", ClientKind::Other, Utc::now()),
            Err(AuthError::KeyDisabled)
        ));

        snap.key_status = KeyStatus::QuotaExhausted;
        assert!(matches!(
            authorize(&snap, "1.2.3.4", ClientKind::Other, Utc::now()),
            Err(AuthError::QuotaExhausted)
        ));
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let mut snap = snapshot();
        let now = Utc::now();
        snap.expires_at = Some(now - Duration::seconds(1));
        assert!(matches!(
            authorize(&snap, "1.2.3.4", ClientKind::Other, now),
            Err(AuthError::KeyExpired)
        ));

        snap.expires_at = Some(now + Duration::hours(1));
        assert!(authorize(&snap, "1.2.3.4", ClientKind::Other, now).is_ok());
    }

    #[test]
    fn quota_limit_zero_means_unlimited() {
        let mut snap = snapshot();
        snap.quota_limit = Decimal::ZERO;
        snap.quota_used = dec!(1000000);
        assert!(authorize(&snap, "1.2.3.4", ClientKind::Other, Utc::now()).is_ok());

        snap.quota_limit = dec!(10);
        snap.quota_used = dec!(10);
        assert!(matches!(
            authorize(&snap, "1.2.3.4", ClientKind::Other, Utc::now()),
            Err(AuthError::QuotaExhausted)
        ));
    }

    #[test]
    fn ip_policy_blacklist_wins() {
        let mut snap = snapshot();
        snap.ip_whitelist = vec!["10.0.*".into()];
        snap.ip_blacklist = vec!["10.0.0.13".into()];

        assert!(authorize(&snap, "10.0.0.1", ClientKind::Other, Utc::now()).is_ok());
        assert!(matches!(
            authorize(&snap, "10.0.0.13", ClientKind::Other, Utc::now()),
            Err(AuthError::IpNotAllowed { .. })
        ));
        assert!(matches!(
            authorize(&snap, "192.168.1.1", ClientKind::Other, Utc::now()),
            Err(AuthError::IpNotAllowed { .. })
        ));
    }

    #[test]
    fn claude_code_gate() {
        let mut snap = snapshot();
        snap.claude_code_only = true;
        assert!(matches!(
            authorize(&snap, "1.2.3.4", ClientKind::Other, Utc::now()),
            Err(AuthError::ClientNotAllowed)
        ));
        assert!(authorize(&snap, "1.2.3.4", ClientKind::ClaudeCode, Utc::now()).is_ok());
    }

    #[test]
    fn client_kind_from_user_agent() {
        assert_eq!(
            ClientKind::from_user_agent(Some("codex_cli_rs/0.42.0"), false),
            ClientKind::CodexCli
        );
        assert_eq!(
            ClientKind::from_user_agent(Some("claude-cli/2.1.0"), false),
            ClientKind::ClaudeCode
        );
        assert_eq!(
            ClientKind::from_user_agent(Some("curl/8.0"), false),
            ClientKind::Other
        );
        assert_eq!(
            ClientKind::from_user_agent(None, true),
            ClientKind::CodexCli
        );
    }
}
