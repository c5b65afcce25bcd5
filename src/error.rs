//! Error types for portcullis.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository / shared-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Authentication errors surfaced to clients with stable codes.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("API key not found")]
    KeyNotFound,

    #[error("API key is disabled")]
    KeyDisabled,

    #[error("API key has expired")]
    KeyExpired,

    #[error("API key quota exhausted")]
    QuotaExhausted,

    #[error("Client IP {ip} is not allowed for this key")]
    IpNotAllowed { ip: String },

    #[error("This key only accepts Claude Code clients")]
    ClientNotAllowed,

    #[error("Too many authentication attempts, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Store error during auth: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Stable machine-readable error code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::KeyNotFound => "API_KEY_NOT_FOUND",
            AuthError::KeyDisabled => "API_KEY_DISABLED",
            AuthError::KeyExpired => "API_KEY_EXPIRED",
            AuthError::QuotaExhausted => "API_KEY_QUOTA_EXHAUSTED",
            AuthError::IpNotAllowed { .. } => "IP_NOT_ALLOWED",
            AuthError::ClientNotAllowed => "CLIENT_NOT_ALLOWED",
            AuthError::RateLimited { .. } => "AUTH_RATE_LIMITED",
            AuthError::Store(_) => "AUTH_INTERNAL_ERROR",
        }
    }

    /// HTTP status class for the error.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::KeyNotFound | AuthError::KeyDisabled | AuthError::KeyExpired => 401,
            AuthError::QuotaExhausted => 402,
            AuthError::IpNotAllowed { .. } | AuthError::ClientNotAllowed => 403,
            AuthError::RateLimited { .. } => 429,
            AuthError::Store(_) => 500,
        }
    }
}

/// Account-selection errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("No available accounts{}", model_suffix(.model))]
    NoAvailableAccounts { model: Option<String> },

    #[error("Slot wait timed out for account {account_id}")]
    SlotWaitTimeout { account_id: Uuid },

    #[error("Store error during scheduling: {0}")]
    Store(#[from] StoreError),
}

fn model_suffix(model: &Option<String>) -> String {
    match model {
        Some(m) => format!(" for model {m}"),
        None => String::new(),
    }
}

/// Upstream forwarding errors.
///
/// `Failover` is the typed signal the enclosing handler uses to retry the
/// request on a different account; everything else terminates the request.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {reason}")]
    Request { reason: String },

    #[error("Upstream {status} on account {account_id}, failover candidate: {message}")]
    Failover {
        account_id: Uuid,
        status: u16,
        message: String,
    },

    #[error("Upstream {status} passed through: {message}")]
    Passthrough {
        status: u16,
        kind: String,
        message: String,
    },

    #[error("Upstream gateway error ({status}): {message}")]
    Gateway { status: u16, message: String },

    #[error("SSE line exceeded maximum size of {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Request cancelled by client")]
    Cancelled,

    #[error("Upstream stream stalled past the data-interval timeout")]
    StreamStalled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    /// Whether the enclosing handler should retry on another account.
    pub fn is_failover(&self) -> bool {
        matches!(self, UpstreamError::Failover { .. })
    }
}

/// Usage-recording errors. Side-effect failures are logged, never surfaced
/// to the client.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Cost calculation failed: {reason}")]
    CostCalculation { reason: String },

    #[error("Usage log insert failed: {0}")]
    Insert(StoreError),

    #[error("Store error during billing: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
