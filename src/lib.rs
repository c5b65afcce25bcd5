//! portcullis, an authenticating reverse proxy for LLM APIs.
//!
//! The gateway multiplexes client requests onto a pool of upstream
//! accounts (OAuth or API-key), enforces per-key quotas and expirations,
//! and bills usage in real time. The request hot path is:
//!
//! ```text
//! client ─► auth (two-tier cache) ─► scheduler (sticky/load/slots)
//!        ─► forwarder (rewrite, SSE relay, failover) ─► usage recorder
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod relay;
pub mod sched;
pub mod server;
pub mod shared;
pub mod store;
pub mod usage;

pub use config::{Config, RunMode};
pub use error::{Error, Result};
