//! Header handling for upstream dispatch.
//!
//! Passthrough mode forwards client headers through a blocklist; every
//! other mode builds the upstream header set from scratch. Inbound
//! credentials never reach the upstream in either mode.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::ExposeSecret;

use crate::auth::ClientKind;
use crate::model::Account;

/// Headers stripped from client requests in passthrough mode: hop-by-hop
/// headers, inbound auth, and framing the gateway owns. `accept-encoding`
/// is stripped so upstream bodies stay parseable for usage extraction.
const BLOCKED_CLIENT_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "authorization",
    "x-api-key",
    "accept-encoding",
    "host",
    "content-length",
];

/// Originator tag sent for Codex-CLI clients.
pub const ORIGINATOR_CODEX_CLI: &str = "codex_cli_rs";
/// Originator tag for everything else.
pub const ORIGINATOR_DEFAULT: &str = "opencode";

/// Filter client headers for passthrough mode.
pub fn filter_client_headers(client: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(client.len());
    for (name, value) in client {
        if BLOCKED_CLIENT_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Minimal required headers for an OAuth Codex upstream call.
///
/// When a `prompt_cache_key` rode in on the body it is mirrored into
/// `conversation_id` and `session_id` so upstream caching stays effective.
pub fn oauth_headers(
    account: &Account,
    bearer: &secrecy::SecretString,
    client: ClientKind,
    prompt_cache_key: Option<&str>,
) -> Result<HeaderMap, reqwest::header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", bearer.expose_secret()))?;
    auth.set_sensitive(true);
    headers.insert("authorization", auth);

    if let Some(account_id) = &account.credentials.account_id {
        headers.insert("chatgpt-account-id", HeaderValue::from_str(account_id)?);
    }
    headers.insert(
        "openai-beta",
        HeaderValue::from_static("responses=experimental"),
    );
    let originator = match client {
        ClientKind::CodexCli => ORIGINATOR_CODEX_CLI,
        _ => ORIGINATOR_DEFAULT,
    };
    headers.insert("originator", HeaderValue::from_static(originator));
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    if let Some(cache_key) = prompt_cache_key {
        let value = HeaderValue::from_str(cache_key)?;
        headers.insert("conversation_id", value.clone());
        headers.insert("session_id", value);
    }

    Ok(headers)
}

/// Minimal headers for an API-key upstream call.
pub fn api_key_headers(
    bearer: &secrecy::SecretString,
) -> Result<HeaderMap, reqwest::header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", bearer.expose_secret()))?;
    auth.set_sensitive(true);
    headers.insert("authorization", auth);
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    Ok(headers)
}

/// Merge required headers over a filtered passthrough set. Required headers
/// win on conflict.
pub fn merge_required(mut base: HeaderMap, required: HeaderMap) -> HeaderMap {
    for (name, value) in required {
        if let Some(name) = name {
            insert_replacing(&mut base, name, value);
        }
    }
    base
}

fn insert_replacing(map: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    map.remove(&name);
    map.insert(name, value);
}
