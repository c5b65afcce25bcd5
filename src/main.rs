//! Gateway binary: load config, wire the components, serve.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;

use portcullis::auth::AuthCache;
use portcullis::config::Config;
use portcullis::relay::rate_limit::AccountRateLimiter;
use portcullis::relay::{Forwarder, ReqwestTransport};
use portcullis::sched::{ConcurrencyService, Scheduler};
use portcullis::server::{AppState, router};
use portcullis::shared::MemoryShared;
use portcullis::store::memory::MemoryStore;
use portcullis::store::postgres::PgStore;
use portcullis::store::{
    ApiKeyStore, AccountStore, LogOpsSink, OpsSink, SubscriptionStore, UsageLogStore, UserStore,
};
use portcullis::usage::{DeferredService, UsageRecorder};

/// How often deferred last_used_at touches flush.
const DEFERRED_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "portcullis", about = "LLM API gateway")]
struct Args {
    /// Override the bind address from configuration.
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
}

struct Stores {
    keys: Arc<dyn ApiKeyStore>,
    users: Arc<dyn UserStore>,
    accounts: Arc<dyn AccountStore>,
    logs: Arc<dyn UsageLogStore>,
    subs: Arc<dyn SubscriptionStore>,
}

async fn build_stores(cfg: &Config) -> anyhow::Result<Stores> {
    match &cfg.database {
        Some(db) => {
            let store = Arc::new(
                PgStore::new(db)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            );
            Ok(Stores {
                keys: store.clone(),
                users: store.clone(),
                accounts: store.clone(),
                logs: store.clone(),
                subs: store,
            })
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running on the in-memory store");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                keys: store.clone(),
                users: store.clone(),
                accounts: store.clone(),
                logs: store.clone(),
                subs: store,
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut cfg = Config::from_env().context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        cfg.server.bind_addr = bind;
    }
    let cfg = Arc::new(cfg);

    let stores = build_stores(&cfg).await?;

    // Single-node shared tier. A clustered deployment swaps in a networked
    // SharedStore implementation here.
    let shared = Arc::new(MemoryShared::new());

    let auth = Arc::new(AuthCache::new(
        cfg.auth_cache.clone(),
        shared.clone(),
        stores.keys.clone(),
    ));
    let _invalidation_listener = auth.spawn_invalidation_listener();

    let slots = ConcurrencyService::new(shared.clone());
    let _slot_cleanup = slots.spawn_cleanup(cfg.sched.slot_cleanup_interval);

    let scheduler = Arc::new(Scheduler::new(
        stores.accounts.clone(),
        shared.clone(),
        slots,
        cfg.sched.clone(),
    ));

    let ops: Arc<dyn OpsSink> = Arc::new(LogOpsSink);
    let rate_limits = Arc::new(AccountRateLimiter::new(stores.accounts.clone()));
    let transport = Arc::new(ReqwestTransport::new().context("failed to build HTTP client")?);
    let forwarder = Arc::new(Forwarder::new(
        transport,
        rate_limits,
        ops.clone(),
        cfg.gateway.clone(),
    ));

    let deferred = DeferredService::new(stores.accounts.clone());
    let _deferred_flusher = deferred.spawn_flusher(DEFERRED_FLUSH_INTERVAL);

    let recorder = Arc::new(UsageRecorder::new(
        stores.logs,
        stores.users,
        stores.keys,
        stores.subs,
        auth.clone(),
        deferred,
        ops,
        cfg.run_mode,
    ));

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        auth,
        scheduler,
        forwarder,
        recorder,
    });

    let listener = tokio::net::TcpListener::bind(cfg.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind_addr))?;
    tracing::info!(addr = %cfg.server.bind_addr, mode = ?cfg.run_mode, "gateway listening");

    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}
