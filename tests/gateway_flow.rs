//! End-to-end request lifecycle tests over the in-memory backends.
//!
//! These drive the real router with a scripted upstream transport and
//! assert the cross-component invariants: slots drain to zero, usage rows
//! are at-most-once, sticky bindings follow account health, and failover
//! walks the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use tower::ServiceExt;
use uuid::Uuid;

use portcullis::auth::AuthCache;
use portcullis::config::{Config, RunMode};
use portcullis::model::{
    Account, AccountCredentials, AccountKind, ApiKey, KeyStatus, Platform, ScheduleState, User,
};
use portcullis::relay::rate_limit::AccountRateLimiter;
use portcullis::relay::{Forwarder, UpstreamRequest, UpstreamTransport};
use portcullis::sched::{ConcurrencyService, Scheduler};
use portcullis::server::{AppState, router};
use portcullis::shared::{MemoryShared, SharedStore};
use portcullis::store::memory::MemoryStore;
use portcullis::store::LogOpsSink;
use portcullis::usage::{DeferredService, UsageRecorder};

/// One canned upstream response.
#[derive(Clone)]
struct Canned {
    status: u16,
    content_type: &'static str,
    body: String,
    headers: Vec<(&'static str, String)>,
}

impl Canned {
    fn json(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    fn sse(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    fn error(status: u16) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: r#"{"error":{"message":"upstream says no"}}"#.to_string(),
            headers: Vec::new(),
        }
    }
}

/// Transport scripted per account id, recording every hit.
struct ScriptedTransport {
    by_account: Mutex<HashMap<Uuid, Canned>>,
    hits: Mutex<Vec<Uuid>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            by_account: Mutex::new(HashMap::new()),
            hits: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, account_id: Uuid, canned: Canned) {
        self.by_account.lock().unwrap().insert(account_id, canned);
    }

    fn hits(&self) -> Vec<Uuid> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(&self, req: UpstreamRequest) -> Result<reqwest::Response, reqwest::Error> {
        self.hits.lock().unwrap().push(req.account_id);
        let canned = self
            .by_account
            .lock()
            .unwrap()
            .get(&req.account_id)
            .cloned()
            .unwrap_or_else(|| Canned::error(500));

        let mut builder = axum::http::Response::builder()
            .status(canned.status)
            .header("content-type", canned.content_type);
        for (name, value) in &canned.headers {
            builder = builder.header(*name, value);
        }
        Ok(reqwest::Response::from(
            builder.body(reqwest::Body::from(canned.body)).unwrap(),
        ))
    }
}

struct Gateway {
    store: Arc<MemoryStore>,
    shared: Arc<MemoryShared>,
    slots: Arc<ConcurrencyService>,
    transport: Arc<ScriptedTransport>,
    router: Router,
}

fn gateway(run_mode: RunMode) -> Gateway {
    let mut cfg = Config {
        server: portcullis::config::ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        },
        database: None,
        auth_cache: Default::default(),
        sched: Default::default(),
        gateway: Default::default(),
        run_mode,
    };
    cfg.sched.fallback_wait_timeout = std::time::Duration::from_millis(200);
    let cfg = Arc::new(cfg);

    let store = Arc::new(MemoryStore::new());
    let shared = Arc::new(MemoryShared::new());
    let auth = Arc::new(AuthCache::new(
        cfg.auth_cache.clone(),
        shared.clone(),
        store.clone(),
    ));
    let slots = ConcurrencyService::new(shared.clone());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        shared.clone(),
        slots.clone(),
        cfg.sched.clone(),
    ));
    let transport = ScriptedTransport::new();
    let forwarder = Arc::new(Forwarder::new(
        transport.clone(),
        Arc::new(AccountRateLimiter::new(store.clone())),
        Arc::new(LogOpsSink),
        cfg.gateway.clone(),
    ));
    let recorder = Arc::new(UsageRecorder::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        auth.clone(),
        DeferredService::new(store.clone()),
        Arc::new(LogOpsSink),
        run_mode,
    ));

    let router = router(Arc::new(AppState {
        cfg,
        auth,
        scheduler,
        forwarder,
        recorder,
    }));

    Gateway {
        store,
        shared,
        slots,
        transport,
        router,
    }
}

fn seed_user_and_key(store: &MemoryStore, secret: &str, quota_limit: Decimal, quota_used: Decimal) -> Uuid {
    let user_id = Uuid::new_v4();
    store.add_user(User {
        id: user_id,
        status: "active".into(),
        role: "user".into(),
        balance: dec!(500),
        concurrency_limit: 16,
    });
    store.add_key(ApiKey {
        id: Uuid::new_v4(),
        user_id,
        secret: SecretString::from(secret.to_string()),
        name: "flow".into(),
        group_id: None,
        status: KeyStatus::Active,
        ip_whitelist: Vec::new(),
        ip_blacklist: Vec::new(),
        quota_limit,
        quota_used,
        expires_at: None,
    });
    user_id
}

fn seed_account(store: &MemoryStore, priority: i32, max_concurrency: u32) -> Uuid {
    let account = Account {
        id: Uuid::new_v4(),
        name: format!("acct-{priority}"),
        platform: Platform::Openai,
        kind: AccountKind::ApiKey,
        credentials: AccountCredentials {
            api_key: Some(SecretString::from("sk-upstream")),
            access_token: None,
            account_id: None,
        },
        priority,
        max_concurrency,
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
    id
}

fn request(key: &str, request_id: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/responses")
        .header("authorization", format!("Bearer {key}"))
        .header("x-request-id", request_id)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const COMPLETED_JSON: &str = r#"{"id":"resp_1","model":"gpt-5-codex","usage":{"input_tokens":1000000,"output_tokens":100000,"input_tokens_details":{"cached_tokens":0}}}"#;

async fn body_string(response: axum::http::Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn unknown_key_is_rejected_with_stable_code() {
    let gw = gateway(RunMode::Normal);
    let response = gw
        .router
        .clone()
        .oneshot(request("sk-nope", "r1", r#"{"model":"gpt-5-codex"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_string(response).await;
    assert!(body.contains("API_KEY_NOT_FOUND"));
}

#[tokio::test]
async fn non_stream_request_bills_and_releases_slot() {
    let gw = gateway(RunMode::Normal);
    let user_id = seed_user_and_key(&gw.store, "sk-flow", Decimal::ZERO, Decimal::ZERO);
    let account = seed_account(&gw.store, 1, 4);
    gw.transport.script(account, Canned::json(COMPLETED_JSON));

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-flow",
            "req-ns-1",
            r#"{"model":"gpt-5-codex","stream":false,"input":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("resp_1"));

    let row = gw.store.usage_log("req-ns-1").expect("usage row");
    assert_eq!(row.usage.input_tokens, 1_000_000);
    assert!(row.actual_cost > Decimal::ZERO);
    assert_eq!(
        gw.store.balance_of(user_id).unwrap(),
        dec!(500) - row.actual_cost
    );
    assert_eq!(gw.slots.live_holds(), 0, "slot must be released");
}

#[tokio::test]
async fn streaming_request_relays_and_bills_after_completion() {
    let gw = gateway(RunMode::Normal);
    seed_user_and_key(&gw.store, "sk-flow", Decimal::ZERO, Decimal::ZERO);
    let account = seed_account(&gw.store, 1, 4);
    gw.transport.script(
        account,
        Canned::sse(concat!(
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hello\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":500,\"output_tokens\":50}}}\n\n",
        )),
    );

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-flow",
            "req-st-1",
            r#"{"model":"gpt-5-codex","stream":true,"input":[]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = body_string(response).await;
    assert!(body.contains("hello"));
    assert!(body.contains("response.completed"));

    // Recording runs on a detached task after the stream ends.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let row = gw.store.usage_log("req-st-1").expect("usage row");
    assert!(row.stream);
    assert_eq!(row.usage.input_tokens, 500);
    assert_eq!(gw.slots.live_holds(), 0);
}

#[tokio::test]
async fn failover_walks_to_the_next_account() {
    let gw = gateway(RunMode::Normal);
    seed_user_and_key(&gw.store, "sk-flow", Decimal::ZERO, Decimal::ZERO);
    let primary = seed_account(&gw.store, 1, 4);
    let secondary = seed_account(&gw.store, 2, 4);
    gw.transport.script(primary, Canned::error(429));
    gw.transport.script(secondary, Canned::json(COMPLETED_JSON));

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-flow",
            "req-fo-1",
            r#"{"model":"gpt-5-codex","stream":false}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Primary was tried first, then the fallback.
    assert_eq!(gw.transport.hits(), vec![primary, secondary]);
    // The 429 moved the primary out of rotation.
    assert_eq!(
        gw.store.account_of(primary).unwrap().schedule_state,
        ScheduleState::RateLimited
    );
    assert!(gw.store.usage_log("req-fo-1").is_some());
    assert_eq!(gw.slots.live_holds(), 0);
}

#[tokio::test]
async fn exhausted_failover_maps_to_fixed_message() {
    let gw = gateway(RunMode::Normal);
    seed_user_and_key(&gw.store, "sk-flow", Decimal::ZERO, Decimal::ZERO);
    let a = seed_account(&gw.store, 1, 4);
    let b = seed_account(&gw.store, 2, 4);
    gw.transport.script(a, Canned::error(429));
    gw.transport.script(b, Canned::error(429));

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-flow",
            "req-fo-2",
            r#"{"model":"gpt-5-codex","stream":false}"#,
        ))
        .await
        .unwrap();
    // Both accounts rate-limited: the pool is empty now, surfaced as 503,
    // or the attempt budget ran out as a 429 mapping. Either way no slot
    // leaks and no usage row exists.
    assert!(
        response.status() == StatusCode::TOO_MANY_REQUESTS
            || response.status() == StatusCode::SERVICE_UNAVAILABLE
    );
    assert!(gw.store.usage_log("req-fo-2").is_none());
    assert_eq!(gw.slots.live_holds(), 0);
}

#[tokio::test]
async fn sticky_session_reuses_the_bound_account() {
    let gw = gateway(RunMode::Normal);
    seed_user_and_key(&gw.store, "sk-flow", Decimal::ZERO, Decimal::ZERO);
    // The sticky target has worse priority, so only the binding explains
    // repeated selection.
    let preferred = seed_account(&gw.store, 1, 4);
    let sticky_target = seed_account(&gw.store, 5, 4);
    gw.transport.script(preferred, Canned::json(COMPLETED_JSON));
    gw.transport
        .script(sticky_target, Canned::json(COMPLETED_JSON));

    let mut first = request(
        "sk-flow",
        "req-sticky-1",
        r#"{"model":"gpt-5-codex","stream":false}"#,
    );
    first
        .headers_mut()
        .insert("session_id", "conv-abc".parse().unwrap());
    let response = gw.router.clone().oneshot(first).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // First pick is by priority.
    assert_eq!(gw.transport.hits(), vec![preferred]);

    // Re-point the binding at the worse-priority account, as if the pool
    // had shifted mid-session.
    let key = portcullis_sticky_key(None, "conv-abc");
    gw.shared
        .set(&key, &sticky_target.to_string(), std::time::Duration::from_secs(3600))
        .await
        .unwrap();

    let mut second = request(
        "sk-flow",
        "req-sticky-2",
        r#"{"model":"gpt-5-codex","stream":false}"#,
    );
    second
        .headers_mut()
        .insert("session_id", "conv-abc".parse().unwrap());
    let response = gw.router.clone().oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gw.transport.hits(), vec![preferred, sticky_target]);
}

/// Mirror of the scheduler's sticky key derivation for test seeding.
fn portcullis_sticky_key(group: Option<Uuid>, session: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(session.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    match group {
        Some(group) => format!("sticky:{group}:openai:{hash}"),
        None => format!("sticky:global:openai:{hash}"),
    }
}

#[tokio::test]
async fn quota_crossing_locks_out_the_next_request() {
    let gw = gateway(RunMode::Normal);
    // 1M input + 100k output of gpt-5-codex ≈ $2.25: crosses a $1 quota.
    seed_user_and_key(&gw.store, "sk-quota", dec!(1.00), dec!(0.99));
    let account = seed_account(&gw.store, 1, 4);
    gw.transport.script(account, Canned::json(COMPLETED_JSON));

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-quota",
            "req-q-1",
            r#"{"model":"gpt-5-codex","stream":false}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-quota",
            "req-q-2",
            r#"{"model":"gpt-5-codex","stream":false}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_string(response).await;
    assert!(body.contains("API_KEY_QUOTA_EXHAUSTED"));
    assert!(gw.store.usage_log("req-q-2").is_none());
}

#[tokio::test]
async fn simple_mode_observes_without_billing() {
    let gw = gateway(RunMode::Simple);
    let user_id = seed_user_and_key(&gw.store, "sk-simple", Decimal::ZERO, Decimal::ZERO);
    let account = seed_account(&gw.store, 1, 4);
    gw.transport.script(account, Canned::json(COMPLETED_JSON));

    let response = gw
        .router
        .clone()
        .oneshot(request(
            "sk-simple",
            "req-simple-1",
            r#"{"model":"gpt-5-codex","stream":false}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let row = gw.store.usage_log("req-simple-1").expect("row recorded");
    assert_eq!(row.billing_type, portcullis::model::BillingType::Unbilled);
    assert_eq!(gw.store.balance_of(user_id).unwrap(), dec!(500));
}
