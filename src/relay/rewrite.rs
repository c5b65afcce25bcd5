//! Request body rewriting for the non-passthrough path.
//!
//! The body is parsed once, edited in place, and re-serialized only when
//! something actually changed.

use bytes::Bytes;
use serde_json::Value;

use crate::auth::ClientKind;
use crate::error::UpstreamError;
use crate::model::{Account, AccountKind, Platform};

/// Instructions injected for OAuth accounts when the client sent none and
/// is not Codex-CLI (which always sends its own).
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a coding assistant. Answer precisely and prefer minimal, correct \
     changes over speculative ones.";

/// Fields the upstream rejects regardless of platform.
const ALWAYS_DROPPED_FIELDS: &[&str] = &[
    "prompt_cache_retention",
    "safety_identifier",
    "previous_response_id",
];

/// A model rename in effect for the response stream: occurrences of
/// `upstream` in payloads are rewritten back to `requested`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRewrite {
    pub upstream: String,
    pub requested: String,
}

impl ModelRewrite {
    pub fn is_identity(&self) -> bool {
        self.upstream == self.requested
    }
}

/// Result of preparing a request body for upstream.
#[derive(Debug)]
pub struct PreparedBody {
    pub body: Bytes,
    /// The model name sent upstream (after alias normalization + mapping).
    pub upstream_model: String,
    /// Response-side rename, present when upstream != requested.
    pub model_rewrite: Option<ModelRewrite>,
    pub prompt_cache_key: Option<String>,
    pub stream: bool,
}

/// Normalize Codex model aliases so rate-limit keys stay stable.
pub fn normalize_codex_model(model: &str) -> String {
    let lower = model.to_ascii_lowercase();
    let trimmed = lower.strip_suffix("-latest").unwrap_or(&lower);
    match trimmed {
        "codex-mini" => "gpt-5.1-codex-mini".to_string(),
        "codex" => "gpt-5-codex".to_string(),
        other => other.to_string(),
    }
}

/// Parse, rewrite, and re-serialize a request body per the account's
/// configuration. Passthrough accounts skip this entirely.
pub fn prepare_body(
    raw: &[u8],
    account: &Account,
    platform: Platform,
    client: ClientKind,
) -> Result<PreparedBody, UpstreamError> {
    let mut body: Value = serde_json::from_slice(raw)?;
    let mut modified = false;

    let requested_model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let normalized = normalize_codex_model(&requested_model);
    let upstream_model = account.map_model(&normalized).to_string();
    if upstream_model != requested_model {
        body["model"] = Value::String(upstream_model.clone());
        modified = true;
    }

    if normalize_reasoning_effort(&mut body) {
        modified = true;
    }

    if account.kind == AccountKind::Oauth
        && client != ClientKind::CodexCli
        && body.get("instructions").is_none_or(Value::is_null)
    {
        body["instructions"] = Value::String(DEFAULT_INSTRUCTIONS.to_string());
        modified = true;
    }

    if apply_field_hygiene(&mut body, platform, client) {
        modified = true;
    }

    let prompt_cache_key = body
        .get("prompt_cache_key")
        .and_then(Value::as_str)
        .map(String::from);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let bytes = if modified {
        Bytes::from(serde_json::to_vec(&body)?)
    } else {
        Bytes::copy_from_slice(raw)
    };

    let model_rewrite = (upstream_model != requested_model && !requested_model.is_empty())
        .then(|| ModelRewrite {
            upstream: upstream_model.clone(),
            requested: requested_model,
        });

    Ok(PreparedBody {
        body: bytes,
        upstream_model,
        model_rewrite,
        prompt_cache_key,
        stream,
    })
}

/// `reasoning.effort`: "minimal" becomes "none"; low/medium/high/xhigh are
/// preserved untouched.
fn normalize_reasoning_effort(body: &mut Value) -> bool {
    let Some(effort) = body
        .get_mut("reasoning")
        .and_then(|r| r.get_mut("effort"))
    else {
        return false;
    };
    if effort.as_str() == Some("minimal") {
        *effort = Value::String("none".to_string());
        return true;
    }
    false
}

/// Per-platform field hygiene for non-Codex requests.
fn apply_field_hygiene(body: &mut Value, platform: Platform, client: ClientKind) -> bool {
    let Some(map) = body.as_object_mut() else {
        return false;
    };
    let mut modified = false;

    for field in ALWAYS_DROPPED_FIELDS {
        if map.remove(*field).is_some() {
            modified = true;
        }
    }

    if client != ClientKind::CodexCli {
        match platform {
            Platform::Anthropic => {
                if let Some(value) = map.remove("max_output_tokens") {
                    map.insert("max_tokens".to_string(), value);
                    modified = true;
                }
            }
            Platform::Gemini | Platform::Antigravity => {
                if map.remove("max_output_tokens").is_some() {
                    modified = true;
                }
            }
            Platform::Openai => {}
        }
    }

    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountCredentials, ScheduleState};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn account(kind: AccountKind) -> Account {
        Account {
            id: Uuid::new_v4(),
            name: "a".into(),
            platform: Platform::Openai,
            kind,
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
        }
    }

    fn parse(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn untouched_body_is_returned_verbatim() {
        let raw = br#"{"model":"gpt-5-codex","input":[],"stream":true}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::ApiKey),
            Platform::Openai,
            ClientKind::CodexCli,
        )
        .unwrap();
        assert_eq!(prepared.body.as_ref(), raw.as_ref());
        assert!(prepared.model_rewrite.is_none());
        assert!(prepared.stream);
    }

    #[test]
    fn model_mapping_rewrites_and_tracks() {
        let mut acct = account(AccountKind::ApiKey);
        acct.model_mapping
            .insert("gpt-5-codex".into(), "gpt-5.1-codex".into());

        let raw = br#"{"model":"gpt-5-codex","input":[]}"#;
        let prepared =
            prepare_body(raw, &acct, Platform::Openai, ClientKind::CodexCli).unwrap();

        assert_eq!(parse(&prepared.body)["model"], "gpt-5.1-codex");
        let rewrite = prepared.model_rewrite.unwrap();
        assert_eq!(rewrite.upstream, "gpt-5.1-codex");
        assert_eq!(rewrite.requested, "gpt-5-codex");
    }

    #[test]
    fn codex_alias_normalization() {
        assert_eq!(normalize_codex_model("gpt-5-codex-latest"), "gpt-5-codex");
        assert_eq!(normalize_codex_model("codex-mini-latest"), "gpt-5.1-codex-mini");
        assert_eq!(normalize_codex_model("GPT-5-Codex"), "gpt-5-codex");
        assert_eq!(normalize_codex_model("o4-mini"), "o4-mini");
    }

    #[test]
    fn minimal_effort_becomes_none() {
        let raw = br#"{"model":"gpt-5-codex","reasoning":{"effort":"minimal"}}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::ApiKey),
            Platform::Openai,
            ClientKind::CodexCli,
        )
        .unwrap();
        assert_eq!(parse(&prepared.body)["reasoning"]["effort"], "none");
    }

    #[test]
    fn other_efforts_are_preserved() {
        for effort in ["low", "medium", "high", "xhigh"] {
            let raw = format!(r#"{{"model":"m","reasoning":{{"effort":"{effort}"}}}}"#);
            let prepared = prepare_body(
                raw.as_bytes(),
                &account(AccountKind::ApiKey),
                Platform::Openai,
                ClientKind::CodexCli,
            )
            .unwrap();
            assert_eq!(parse(&prepared.body)["reasoning"]["effort"], effort);
        }
    }

    #[test]
    fn oauth_injects_instructions_for_non_codex_clients() {
        let raw = br#"{"model":"gpt-5-codex","input":[]}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::Oauth),
            Platform::Openai,
            ClientKind::Other,
        )
        .unwrap();
        assert_eq!(
            parse(&prepared.body)["instructions"],
            DEFAULT_INSTRUCTIONS
        );
    }

    #[test]
    fn oauth_keeps_codex_cli_instructions_absent() {
        let raw = br#"{"model":"gpt-5-codex","input":[]}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::Oauth),
            Platform::Openai,
            ClientKind::CodexCli,
        )
        .unwrap();
        assert!(parse(&prepared.body).get("instructions").is_none());
    }

    #[test]
    fn client_instructions_are_never_replaced() {
        let raw = br#"{"model":"m","instructions":"mine"}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::Oauth),
            Platform::Openai,
            ClientKind::Other,
        )
        .unwrap();
        assert_eq!(parse(&prepared.body)["instructions"], "mine");
    }

    #[test]
    fn rejected_fields_are_always_dropped() {
        let raw = br#"{"model":"m","prompt_cache_retention":"24h","safety_identifier":"x","previous_response_id":"r1"}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::ApiKey),
            Platform::Openai,
            ClientKind::CodexCli,
        )
        .unwrap();
        let body = parse(&prepared.body);
        assert!(body.get("prompt_cache_retention").is_none());
        assert!(body.get("safety_identifier").is_none());
        assert!(body.get("previous_response_id").is_none());
    }

    #[test]
    fn anthropic_translates_max_output_tokens() {
        let raw = br#"{"model":"m","max_output_tokens":4096}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::ApiKey),
            Platform::Anthropic,
            ClientKind::Other,
        )
        .unwrap();
        let body = parse(&prepared.body);
        assert!(body.get("max_output_tokens").is_none());
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn gemini_drops_max_output_tokens() {
        let raw = br#"{"model":"m","max_output_tokens":4096}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::ApiKey),
            Platform::Gemini,
            ClientKind::Other,
        )
        .unwrap();
        assert!(parse(&prepared.body).get("max_output_tokens").is_none());
    }

    #[test]
    fn prompt_cache_key_is_extracted() {
        let raw = br#"{"model":"m","prompt_cache_key":"pck-1"}"#;
        let prepared = prepare_body(
            raw,
            &account(AccountKind::ApiKey),
            Platform::Openai,
            ClientKind::CodexCli,
        )
        .unwrap();
        assert_eq!(prepared.prompt_cache_key.as_deref(), Some("pck-1"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let result = prepare_body(
            b"not json",
            &account(AccountKind::ApiKey),
            Platform::Openai,
            ClientKind::Other,
        );
        assert!(result.is_err());
    }
}
