//! Upstream forwarding.
//!
//! The forwarder rewrites the client request for the selected account,
//! dispatches it through the transport seam, classifies failures into
//! {passthrough, failover, terminal}, and relays successful responses:
//! streaming through the SSE pump, buffered otherwise.

pub mod headers;
pub mod rate_limit;
pub mod rewrite;
pub mod sse;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::ClientKind;
use crate::config::GatewayConfig;
use crate::error::UpstreamError;
use crate::model::{Account, AccountKind, Platform, Usage};
use crate::relay::rate_limit::RateLimitService;
use crate::relay::rewrite::{ModelRewrite, prepare_body};
use crate::relay::sse::{SsePumpConfig, StreamEnd, StreamOutcome};
use crate::store::{OpsSink, RequestErrorEvent};

/// Default API-key base when the account configures none.
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
/// OAuth Codex endpoint; the Host header comes from the URL, never a
/// header override.
const CHATGPT_CODEX_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

/// Statuses that should move the request to another account.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 402 | 403 | 429 | 529) || status >= 500
}

/// Fixed client-visible mapping for terminal upstream failures.
pub fn terminal_message(status: u16) -> (u16, &'static str) {
    match status {
        401 => (401, "Upstream authentication failed"),
        402 => (402, "Upstream account payment required"),
        403 => (403, "Upstream access denied"),
        429 => (429, "Upstream rate limited, please retry later"),
        _ => (500, "upstream gateway error"),
    }
}

/// Scrub credential-shaped tokens out of an error string before it can
/// reach logs or clients.
pub fn sanitize_error(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut redact_next = false;
    for word in text.split_whitespace() {
        if redact_next {
            out.push("[redacted]".to_string());
            redact_next = false;
            continue;
        }
        if word == "Bearer" || word == "bearer" {
            out.push(word.to_string());
            redact_next = true;
        } else if word.contains("sk-") || word.contains("Bearer") {
            out.push("[redacted]".to_string());
        } else {
            out.push(word.to_string());
        }
    }
    out.join(" ")
}

/// One prepared upstream dispatch.
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub proxy_url: Option<String>,
    pub account_id: Uuid,
    pub max_concurrency: u32,
}

/// The upstream HTTP client seam.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, req: UpstreamRequest) -> Result<reqwest::Response, reqwest::Error>;
}

/// reqwest-backed transport with per-proxy client caching.
pub struct ReqwestTransport {
    default: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let default = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            default,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
        let Some(proxy_url) = proxy_url else {
            return Ok(self.default.clone());
        };
        {
            let proxied = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = proxied.get(proxy_url) {
                return Ok(client.clone());
            }
        }
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .build()?;
        let mut proxied = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        proxied.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(&self, req: UpstreamRequest) -> Result<reqwest::Response, reqwest::Error> {
        let client = self.client_for(req.proxy_url.as_deref())?;
        client
            .post(&req.url)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await
    }
}

/// Resolve the upstream endpoint for the account.
///
/// API-key base URLs are validated against the allow-list (when set) and
/// normalized so a trailing `/v1` or `/responses` is respected.
pub fn upstream_url(account: &Account, allowed: &[String]) -> Result<String, UpstreamError> {
    if account.kind == AccountKind::Oauth {
        return Ok(CHATGPT_CODEX_URL.to_string());
    }
    let base = account
        .base_url
        .as_deref()
        .unwrap_or(OPENAI_API_BASE)
        .trim_end_matches('/')
        .to_string();

    let parsed = url::Url::parse(&base).map_err(|e| UpstreamError::Request {
        reason: format!("invalid account base URL: {e}"),
    })?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(UpstreamError::Request {
            reason: format!("unsupported base URL scheme '{}'", parsed.scheme()),
        });
    }

    if !allowed.is_empty() && !allowed.iter().any(|a| base.starts_with(a.as_str())) {
        return Err(UpstreamError::Request {
            reason: "account base URL is not in the allow-list".to_string(),
        });
    }

    if base.ends_with("/responses") {
        Ok(base)
    } else if base.ends_with("/v1") {
        Ok(format!("{base}/responses"))
    } else {
        Ok(format!("{base}/v1/responses"))
    }
}

/// Per-request input to the forwarder.
pub struct ForwardContext {
    pub request_id: String,
    /// Model the client asked for (before mapping).
    pub model: String,
    pub client: ClientKind,
    pub platform: Platform,
    pub body: Bytes,
    pub client_headers: HeaderMap,
    pub cancel: CancellationToken,
}

/// A successful forward, as seen by the entry handler.
#[derive(Debug)]
pub enum Forwarded {
    /// SSE relay: build the client response body from `rx`; `outcome`
    /// resolves when the stream finishes (even after client disconnect).
    Stream {
        rx: mpsc::Receiver<Result<Bytes, std::convert::Infallible>>,
        outcome: tokio::task::JoinHandle<StreamOutcome>,
    },
    /// Buffered reply.
    Json {
        status: u16,
        body: Bytes,
        usage: Usage,
    },
}

/// Upstream forwarder for the OpenAI Responses path. Anthropic and Gemini
/// dispatch follow the same shape with their own rewrite tables.
pub struct Forwarder {
    transport: Arc<dyn UpstreamTransport>,
    rate_limits: Arc<dyn RateLimitService>,
    ops: Arc<dyn OpsSink>,
    cfg: GatewayConfig,
}

impl Forwarder {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        rate_limits: Arc<dyn RateLimitService>,
        ops: Arc<dyn OpsSink>,
        cfg: GatewayConfig,
    ) -> Self {
        Self {
            transport,
            rate_limits,
            ops,
            cfg,
        }
    }

    /// Send the request on `account` and relay the response.
    pub async fn forward(
        &self,
        account: &Account,
        ctx: &ForwardContext,
    ) -> Result<Forwarded, UpstreamError> {
        let (body, model_rewrite, prompt_cache_key, wants_stream) =
            self.prepare(account, ctx)?;

        let upstream_headers = self.build_headers(account, ctx, prompt_cache_key.as_deref())?;
        let url = upstream_url(account, &self.cfg.allowed_base_urls)?;

        let request = UpstreamRequest {
            url,
            headers: upstream_headers,
            body,
            proxy_url: account.proxy_url.clone(),
            account_id: account.id,
            max_concurrency: account.max_concurrency,
        };

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                let reason = sanitize_error(&e.to_string());
                self.ops
                    .request_error(RequestErrorEvent {
                        request_id: ctx.request_id.clone(),
                        account_id: Some(account.id),
                        status: 502,
                        message: reason.clone(),
                        at: Utc::now(),
                    })
                    .await;
                return Err(UpstreamError::Request { reason });
            }
        };

        // Codex usage headers ride on every OAuth response.
        if account.kind == AccountKind::Oauth {
            self.rate_limits.ingest_headers(account, response.headers());
        }

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(self.classify_failure(account, ctx, response).await);
        }

        let upstream_is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if wants_stream && upstream_is_sse {
            return Ok(self.spawn_stream(account, response, model_rewrite, ctx.cancel.clone()));
        }

        if upstream_is_sse {
            // OAuth upstream always answers in SSE; the client asked for
            // JSON, so buffer and extract the terminal response payload.
            return self
                .buffer_sse_as_json(account, response, model_rewrite)
                .await;
        }

        self.buffer_json(response, model_rewrite).await
    }

    fn prepare(
        &self,
        account: &Account,
        ctx: &ForwardContext,
    ) -> Result<(Bytes, Option<ModelRewrite>, Option<String>, bool), UpstreamError> {
        if account.passthrough {
            // Verbatim body; read stream flag and cache key without
            // touching the bytes.
            let parsed: Value = serde_json::from_slice(&ctx.body)?;
            let stream = parsed
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let cache_key = parsed
                .get("prompt_cache_key")
                .and_then(Value::as_str)
                .map(String::from);
            return Ok((ctx.body.clone(), None, cache_key, stream));
        }

        let prepared = prepare_body(&ctx.body, account, ctx.platform, ctx.client)?;
        Ok((
            prepared.body,
            prepared.model_rewrite,
            prepared.prompt_cache_key,
            prepared.stream,
        ))
    }

    fn build_headers(
        &self,
        account: &Account,
        ctx: &ForwardContext,
        prompt_cache_key: Option<&str>,
    ) -> Result<HeaderMap, UpstreamError> {
        let bearer = match account.kind {
            AccountKind::Oauth => account.credentials.access_token.clone(),
            AccountKind::ApiKey => account.credentials.api_key.clone(),
        }
        .ok_or_else(|| UpstreamError::Request {
            reason: "account has no usable credentials".to_string(),
        })?;

        let required = match account.kind {
            AccountKind::Oauth => {
                headers::oauth_headers(account, &bearer, ctx.client, prompt_cache_key)
            }
            AccountKind::ApiKey => headers::api_key_headers(&bearer),
        }
        .map_err(|e| UpstreamError::Request {
            reason: format!("invalid upstream header: {e}"),
        })?;

        if account.passthrough {
            let filtered = headers::filter_client_headers(&ctx.client_headers);
            Ok(headers::merge_required(filtered, required))
        } else {
            Ok(required)
        }
    }

    /// Classify an upstream failure (status ≥ 400).
    async fn classify_failure(
        &self,
        account: &Account,
        ctx: &ForwardContext,
        response: reqwest::Response,
    ) -> UpstreamError {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        if self.cfg.log_upstream_error_body {
            let cap = self.cfg.log_upstream_error_body_max_bytes;
            let preview: String = body.chars().take(cap).collect();
            tracing::warn!(
                status,
                account_id = %account.id,
                body = %sanitize_error(&preview),
                "upstream error body"
            );
        }

        // An account-configured passthrough rule wins over failover.
        if let Some(rule) = account.error_rules.get(&status) {
            if rule.passthrough {
                return UpstreamError::Passthrough {
                    status,
                    kind: rule.kind.clone().unwrap_or_else(|| "upstream_error".into()),
                    message: rule
                        .message
                        .clone()
                        .unwrap_or_else(|| sanitize_error(&body)),
                };
            }
        }

        if is_failover_status(status) {
            self.rate_limits
                .ingest_failure(account, &ctx.model, status, &headers)
                .await;
            return UpstreamError::Failover {
                account_id: account.id,
                status,
                message: sanitize_error(&body),
            };
        }

        match account.error_rules.get(&status) {
            // Handled terminal code with a fixed mapping.
            Some(rule) => {
                let (mapped_status, fixed) = terminal_message(status);
                UpstreamError::Gateway {
                    status: mapped_status,
                    message: rule.message.clone().unwrap_or_else(|| fixed.to_string()),
                }
            }
            // Codes the account does not handle collapse to a 500.
            None => UpstreamError::Gateway {
                status: 500,
                message: "upstream gateway error".to_string(),
            },
        }
    }

    fn spawn_stream(
        &self,
        account: &Account,
        response: reqwest::Response,
        model_rewrite: Option<ModelRewrite>,
        cancel: CancellationToken,
    ) -> Forwarded {
        let (tx, rx) = mpsc::channel(64);
        let pump_cfg = SsePumpConfig {
            max_line_size: self.cfg.max_line_size,
            data_interval_timeout: self.cfg.data_interval_timeout,
            keepalive_interval: self.cfg.keepalive_interval,
        };
        let fix_tool_calls = account.kind == AccountKind::Oauth;
        let rate_limits = Arc::clone(&self.rate_limits);
        let account_id = account.id;

        let outcome = tokio::spawn(async move {
            let outcome =
                sse::pump(response, tx, model_rewrite, fix_tool_calls, pump_cfg, cancel).await;
            if outcome.end == StreamEnd::Stalled {
                rate_limits.note_stream_timeout(account_id).await;
            }
            outcome
        });

        Forwarded::Stream { rx, outcome }
    }

    /// OAuth SSE answering a non-streaming client: extract the terminal
    /// `response` payload and return it as JSON.
    async fn buffer_sse_as_json(
        &self,
        account: &Account,
        response: reqwest::Response,
        model_rewrite: Option<ModelRewrite>,
    ) -> Result<Forwarded, UpstreamError> {
        let status = response.status().as_u16();
        let text = response.text().await?;

        if let Some(mut payload) = sse::extract_terminal_response(&text) {
            if let Some(rewrite) = &model_rewrite {
                if payload.get("model").and_then(Value::as_str) == Some(&rewrite.upstream) {
                    payload["model"] = Value::String(rewrite.requested.clone());
                }
            }
            if account.kind == AccountKind::Oauth {
                sse::correct_tool_calls_value(&mut payload);
            }
            let usage = payload
                .get("usage")
                .map(sse::usage_from_value)
                .unwrap_or_default();
            return Ok(Forwarded::Json {
                status,
                body: Bytes::from(serde_json::to_vec(&payload)?),
                usage,
            });
        }

        // No terminal event found: surface the body as-is, still billing
        // whatever usage the SSE text carries.
        let usage = sse::scan_usage(&text);
        Ok(Forwarded::Json {
            status,
            body: Bytes::from(text),
            usage,
        })
    }

    async fn buffer_json(
        &self,
        response: reqwest::Response,
        model_rewrite: Option<ModelRewrite>,
    ) -> Result<Forwarded, UpstreamError> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        let mut payload: Value = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(_) => {
                // Non-JSON success body: relay verbatim, nothing to bill.
                return Ok(Forwarded::Json {
                    status,
                    body: bytes,
                    usage: Usage::default(),
                });
            }
        };

        let usage = payload
            .get("usage")
            .map(sse::usage_from_value)
            .unwrap_or_default();

        let body = if let Some(rewrite) = &model_rewrite {
            if payload.get("model").and_then(Value::as_str) == Some(&rewrite.upstream) {
                payload["model"] = Value::String(rewrite.requested.clone());
                Bytes::from(serde_json::to_vec(&payload)?)
            } else {
                bytes
            }
        } else {
            bytes
        };

        Ok(Forwarded::Json {
            status,
            body,
            usage,
        })
    }
}
