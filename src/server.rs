//! Thin HTTP entry layer.
//!
//! One handler drives the whole hot path: auth → schedule → forward →
//! record, including the in-request failover loop over accounts and
//! wait-plan execution. Everything interesting lives in the components;
//! this file only wires them together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AuthCache, ClientKind, authorize};
use crate::config::Config;
use crate::error::{ScheduleError, UpstreamError};
use crate::model::{Platform, Usage};
use crate::relay::{ForwardContext, Forwarded, Forwarder, terminal_message};
use crate::sched::{Scheduler, Selection, SlotPermit};
use crate::usage::{RecordContext, UsageRecorder};

/// Accounts tried per request before giving up.
const MAX_FAILOVER_ATTEMPTS: usize = 3;

/// Shared application state behind the router.
pub struct AppState {
    pub cfg: Arc<Config>,
    pub auth: Arc<AuthCache>,
    pub scheduler: Arc<Scheduler>,
    pub forwarder: Arc<Forwarder>,
    pub recorder: Arc<UsageRecorder>,
}

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/responses", post(responses))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_response(status: u16, code: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": { "code": code, "message": message }
    });
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

/// Bearer token from `Authorization` or `x-api-key`.
fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Client address as reported by the proxy chain in front of us.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

/// Session identity for sticky scheduling: explicit headers first, then the
/// body's prompt cache key. Empty means no stickiness.
fn derive_session(headers: &HeaderMap, body: &Value) -> Option<String> {
    for name in ["session_id", "conversation_id"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    body.get("prompt_cache_key")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let Some(raw_key) = extract_key(&headers) else {
        return error_response(401, "API_KEY_NOT_FOUND", "missing API key");
    };

    let snapshot = match state.auth.lookup(&raw_key).await {
        Ok(snapshot) => snapshot,
        Err(e) => return error_response(e.status(), e.code(), &e.to_string()),
    };

    let client = ClientKind::from_user_agent(
        headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()),
        state.cfg.gateway.force_codex_cli,
    );
    let ip = client_ip(&headers);
    if let Err(e) = authorize(&snapshot, &ip, client, Utc::now()) {
        return error_response(e.status(), e.code(), &e.to_string());
    }

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(400, "INVALID_REQUEST", &format!("invalid JSON body: {e}")),
    };
    let model = parsed
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if model.is_empty() {
        return error_response(400, "INVALID_REQUEST", "missing model");
    }
    let thinking = parsed
        .get("reasoning")
        .and_then(|r| r.get("effort"))
        .and_then(Value::as_str)
        .is_some_and(|effort| effort != "none");
    let session = derive_session(&headers, &parsed);

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let platform = snapshot.platform.unwrap_or(Platform::Openai);

    let mut excluded: HashSet<Uuid> = HashSet::new();
    let mut last_failover_status = 500u16;

    for _attempt in 0..MAX_FAILOVER_ATTEMPTS {
        let selection = state
            .scheduler
            .select(&crate::sched::SelectRequest {
                snapshot: &snapshot,
                platform,
                model: &model,
                session: session.as_deref(),
                thinking,
                excluded: &excluded,
            })
            .await;

        let (account, permit) = match selection {
            Ok(Selection::Acquired { account, permit }) => (account, permit),
            Ok(Selection::Wait { account, plan }) => {
                match state.scheduler.slots().wait_for_slot(&plan).await {
                    Ok(Some(permit)) => (account, permit),
                    Ok(None) => {
                        return error_response(
                            503,
                            "NO_AVAILABLE_ACCOUNTS",
                            "all accounts are at capacity, please retry",
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "slot wait failed");
                        return error_response(500, "SCHEDULER_ERROR", "internal scheduling error");
                    }
                }
            }
            Err(ScheduleError::NoAvailableAccounts { .. }) => {
                return error_response(
                    503,
                    "NO_AVAILABLE_ACCOUNTS",
                    &format!("no available accounts for model {model}"),
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "account selection failed");
                return error_response(500, "SCHEDULER_ERROR", "internal scheduling error");
            }
        };

        let ctx = ForwardContext {
            request_id: request_id.clone(),
            model: model.clone(),
            client,
            platform,
            body: body.clone(),
            client_headers: headers.clone(),
            cancel: CancellationToken::new(),
        };

        match state.forwarder.forward(&account, &ctx).await {
            Ok(Forwarded::Stream { rx, outcome }) => {
                return stream_response(state, snapshot, account.id, model, request_id, started, rx, outcome, permit);
            }
            Ok(Forwarded::Json {
                status,
                body,
                usage,
            }) => {
                state
                    .recorder
                    .record(RecordContext {
                        request_id,
                        snapshot: Arc::clone(&snapshot),
                        account_id: account.id,
                        model,
                        usage,
                        stream: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        first_token_ms: None,
                    })
                    .await;
                permit.release().await;
                return Response::builder()
                    .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap_or_default();
            }
            Err(err) => {
                permit.release().await;
                match err {
                    UpstreamError::Failover {
                        account_id, status, ..
                    } => {
                        excluded.insert(account_id);
                        last_failover_status = status;
                        continue;
                    }
                    UpstreamError::Passthrough {
                        status,
                        kind,
                        message,
                    } => return error_response(status, &kind, &message),
                    UpstreamError::Gateway { status, message } => {
                        return error_response(status, "UPSTREAM_ERROR", &message);
                    }
                    UpstreamError::Request { reason } => {
                        return error_response(502, "UPSTREAM_REQUEST_FAILED", &reason);
                    }
                    other => {
                        tracing::error!(error = %other, "forward failed");
                        return error_response(500, "UPSTREAM_ERROR", "upstream gateway error");
                    }
                }
            }
        }
    }

    // Failover attempts exhausted: map the last upstream status to its
    // fixed client-visible message.
    let (status, message) = terminal_message(last_failover_status);
    error_response(status, "UPSTREAM_ERROR", message)
}

/// Build the SSE response and hand stream completion to a detached task so
/// usage is recorded and the slot released even if the client goes away.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: Arc<AppState>,
    snapshot: Arc<crate::auth::AuthSnapshot>,
    account_id: Uuid,
    model: String,
    request_id: String,
    started: Instant,
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, std::convert::Infallible>>,
    outcome: tokio::task::JoinHandle<crate::relay::sse::StreamOutcome>,
    permit: SlotPermit,
) -> Response {
    tokio::spawn(async move {
        let (usage, first_token_ms) = match outcome.await {
            Ok(outcome) => (outcome.usage, outcome.first_token_ms),
            Err(e) => {
                tracing::error!(error = %e, "stream pump task failed");
                (Usage::default(), None)
            }
        };
        state
            .recorder
            .record(RecordContext {
                request_id,
                snapshot,
                account_id,
                model,
                usage,
                stream: true,
                duration_ms: started.elapsed().as_millis() as u64,
                first_token_ms,
            })
            .await;
        permit.release().await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_default()
}
