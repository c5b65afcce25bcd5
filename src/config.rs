//! Configuration for the portcullis gateway.

use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Deployment posture. `Simple` observes usage but performs no billing
/// side-effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    Simple,
}

/// Main configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub auth_cache: AuthCacheConfig,
    pub sched: SchedConfig,
    pub gateway: GatewayConfig,
    pub run_mode: RunMode,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let run_mode = match optional_env("RUN_MODE")?.as_deref() {
            None | Some("normal") => RunMode::Normal,
            Some("simple") => RunMode::Simple,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "RUN_MODE".to_string(),
                    message: format!("expected 'normal' or 'simple', got '{other}'"),
                });
            }
        };

        Ok(Self {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            auth_cache: AuthCacheConfig::from_env()?,
            sched: SchedConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
            run_mode,
        })
    }
}

/// HTTP entry configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = optional_env("BIND_ADDR")?
            .unwrap_or_else(|| "127.0.0.1:8787".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "BIND_ADDR".to_string(),
                message: format!("must be host:port: {e}"),
            })?;
        Ok(Self { bind_addr })
    }
}

/// Database configuration. Absent when no `DATABASE_URL` is set, in which
/// case the gateway runs on the in-memory store (tests, demos).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(url) = optional_env("DATABASE_URL")? else {
            return Ok(None);
        };
        let pool_size = parse_optional_env("DATABASE_POOL_SIZE", 10usize)?;
        Ok(Some(Self {
            url: SecretString::from(url),
            pool_size,
        }))
    }
}

/// Two-tier auth cache tuning.
#[derive(Debug, Clone)]
pub struct AuthCacheConfig {
    /// Bounded size of the in-process tier.
    pub l1_size: u64,
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    /// Shorter TTL applied to not-found entries.
    pub negative_ttl: Duration,
    /// ± percentage applied to L1 TTLs to avoid stampedes.
    pub jitter_percent: u8,
    pub singleflight: bool,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            l1_size: 10_000,
            l1_ttl: Duration::from_secs(30),
            l2_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            jitter_percent: 10,
            singleflight: true,
        }
    }
}

impl AuthCacheConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let jitter_percent: u8 = parse_optional_env("AUTH_CACHE_JITTER_PERCENT", 10u8)?;
        if jitter_percent >= 100 {
            return Err(ConfigError::InvalidValue {
                key: "AUTH_CACHE_JITTER_PERCENT".to_string(),
                message: "must be below 100".to_string(),
            });
        }
        Ok(Self {
            l1_size: parse_optional_env("AUTH_CACHE_L1_SIZE", defaults.l1_size)?,
            l1_ttl: secs_env("AUTH_CACHE_L1_TTL_SECS", defaults.l1_ttl)?,
            l2_ttl: secs_env("AUTH_CACHE_L2_TTL_SECS", defaults.l2_ttl)?,
            negative_ttl: secs_env("AUTH_CACHE_NEGATIVE_TTL_SECS", defaults.negative_ttl)?,
            jitter_percent,
            singleflight: parse_optional_env("AUTH_CACHE_SINGLEFLIGHT", true)?,
        })
    }
}

/// Scheduler and slot tuning.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub sticky_max_waiting: u64,
    pub sticky_wait_timeout: Duration,
    pub fallback_wait_timeout: Duration,
    pub fallback_max_waiting: u64,
    pub load_batch_enabled: bool,
    pub slot_cleanup_interval: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            sticky_max_waiting: 3,
            sticky_wait_timeout: Duration::from_secs(45),
            fallback_wait_timeout: Duration::from_secs(30),
            fallback_max_waiting: 5,
            load_batch_enabled: true,
            slot_cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl SchedConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            sticky_max_waiting: parse_optional_env("STICKY_MAX_WAITING", defaults.sticky_max_waiting)?,
            sticky_wait_timeout: secs_env("STICKY_WAIT_TIMEOUT_SECS", defaults.sticky_wait_timeout)?,
            fallback_wait_timeout: secs_env(
                "FALLBACK_WAIT_TIMEOUT_SECS",
                defaults.fallback_wait_timeout,
            )?,
            fallback_max_waiting: parse_optional_env(
                "FALLBACK_MAX_WAITING",
                defaults.fallback_max_waiting,
            )?,
            load_batch_enabled: parse_optional_env("LOAD_BATCH_ENABLED", true)?,
            slot_cleanup_interval: secs_env(
                "SLOT_CLEANUP_INTERVAL_SECS",
                defaults.slot_cleanup_interval,
            )?,
        })
    }
}

/// Forwarder and SSE relay tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum accepted SSE line length in bytes.
    pub max_line_size: usize,
    /// Terminate the stream when no upstream byte arrives for this long.
    pub data_interval_timeout: Duration,
    /// Write a comment line downstream when nothing was flushed for this long.
    pub keepalive_interval: Duration,
    pub log_upstream_error_body: bool,
    pub log_upstream_error_body_max_bytes: usize,
    /// Present as Codex-CLI upstream regardless of the client's user agent.
    pub force_codex_cli: bool,
    /// Allow-list for account-scoped base URLs; empty allows any.
    pub allowed_base_urls: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_line_size: 64 * 1024,
            data_interval_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(15),
            log_upstream_error_body: false,
            log_upstream_error_body_max_bytes: 2048,
            force_codex_cli: false,
            allowed_base_urls: Vec::new(),
        }
    }
}

impl GatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let allowed_base_urls = optional_env("ALLOWED_BASE_URLS")?
            .map(|s| {
                s.split(',')
                    .map(|u| u.trim().trim_end_matches('/').to_string())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            max_line_size: parse_optional_env("MAX_LINE_SIZE", defaults.max_line_size)?,
            data_interval_timeout: secs_env(
                "STREAM_DATA_INTERVAL_TIMEOUT_SECS",
                defaults.data_interval_timeout,
            )?,
            keepalive_interval: secs_env(
                "STREAM_KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval,
            )?,
            log_upstream_error_body: parse_optional_env("LOG_UPSTREAM_ERROR_BODY", false)?,
            log_upstream_error_body_max_bytes: parse_optional_env(
                "LOG_UPSTREAM_ERROR_BODY_MAX_BYTES",
                defaults.log_upstream_error_body_max_bytes,
            )?,
            force_codex_cli: parse_optional_env("FORCE_CODEX_CLI", false)?,
            allowed_base_urls,
        })
    }
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("failed to read: {e}"),
        }),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_optional_env(
        key,
        default.as_secs(),
    )?))
}
