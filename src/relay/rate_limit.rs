//! Rate-limit state driven by upstream responses.
//!
//! The scheduler treats account state as advisory; this service is the only
//! writer. Codex usage headers are parsed after every OAuth response and the
//! normalized windows are written asynchronously into the account's opaque
//! extra map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Account, ScheduleState};
use crate::store::AccountStore;

/// Fallback rate-limit hold when upstream gives no retry hint.
const DEFAULT_RATE_LIMIT_HOLD: Duration = Duration::from_secs(60);

/// A window is "short" (the 5h bucket) when its span is at most this many
/// minutes and it is the only window reported.
const SHORT_WINDOW_MAX_MINUTES: u64 = 360;

/// One usage window reported by Codex headers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub used_percent: f64,
    pub reset_after_seconds: Option<u64>,
    pub window_minutes: Option<u64>,
}

/// Which header family a normalized window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    Primary,
    Secondary,
}

/// Raw parse of the `x-codex-*` header families.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodexRateHeaders {
    pub primary: Option<RateWindow>,
    pub secondary: Option<RateWindow>,
    pub over_secondary_limit_percent: Option<f64>,
}

impl CodexRateHeaders {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

/// Windows assigned to the canonical buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedWindows {
    #[serde(rename = "5h", skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<LabeledWindow>,
    #[serde(rename = "7d", skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<LabeledWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub over_secondary_limit_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledWindow {
    #[serde(flatten)]
    pub window: RateWindow,
    pub source: WindowSource,
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn parse_window(headers: &HeaderMap, family: &str) -> Option<RateWindow> {
    let used_percent = header_f64(headers, &format!("x-codex-{family}-used-percent"))?;
    Some(RateWindow {
        used_percent,
        reset_after_seconds: header_u64(
            headers,
            &format!("x-codex-{family}-reset-after-seconds"),
        ),
        window_minutes: header_u64(headers, &format!("x-codex-{family}-window-minutes")),
    })
}

/// Parse the Codex usage header families.
pub fn parse_codex_headers(headers: &HeaderMap) -> CodexRateHeaders {
    CodexRateHeaders {
        primary: parse_window(headers, "primary"),
        secondary: parse_window(headers, "secondary"),
        over_secondary_limit_percent: header_f64(
            headers,
            "x-codex-primary-over-secondary-limit-percent",
        ),
    }
}

/// Assign parsed windows to the canonical "5h"/"7d" buckets.
///
/// The shorter window goes to "5h" and the larger to "7d". With a single
/// window its span decides (≤ 360 minutes reads as the 5h bucket). With no
/// window spans known at all, primary maps to "7d" and secondary to "5h".
pub fn normalize_windows(parsed: &CodexRateHeaders) -> NormalizedWindows {
    let mut out = NormalizedWindows {
        over_secondary_limit_percent: parsed.over_secondary_limit_percent,
        ..Default::default()
    };

    let label = |window: RateWindow, source: WindowSource| LabeledWindow { window, source };

    match (parsed.primary, parsed.secondary) {
        (Some(primary), Some(secondary)) => {
            match (primary.window_minutes, secondary.window_minutes) {
                (Some(p), Some(s)) if p <= s => {
                    out.five_hour = Some(label(primary, WindowSource::Primary));
                    out.seven_day = Some(label(secondary, WindowSource::Secondary));
                }
                (Some(_), Some(_)) => {
                    out.five_hour = Some(label(secondary, WindowSource::Secondary));
                    out.seven_day = Some(label(primary, WindowSource::Primary));
                }
                // Spans unknown: primary=7d, secondary=5h.
                _ => {
                    out.seven_day = Some(label(primary, WindowSource::Primary));
                    out.five_hour = Some(label(secondary, WindowSource::Secondary));
                }
            }
        }
        (Some(only), None) | (None, Some(only)) => {
            let source = if parsed.primary.is_some() {
                WindowSource::Primary
            } else {
                WindowSource::Secondary
            };
            let is_short = only
                .window_minutes
                .map(|m| m <= SHORT_WINDOW_MAX_MINUTES)
                // Unknown span on a lone secondary window reads as 5h.
                .unwrap_or(source == WindowSource::Secondary);
            if is_short {
                out.five_hour = Some(label(only, source));
            } else {
                out.seven_day = Some(label(only, source));
            }
        }
        (None, None) => {}
    }

    out
}

/// The patch written into `accounts.extra` for a header ingestion.
pub fn extra_patch(parsed: &CodexRateHeaders) -> serde_json::Map<String, serde_json::Value> {
    let mut patch = serde_json::Map::new();
    if let Ok(value) = serde_json::to_value(normalize_windows(parsed)) {
        patch.insert("codex_rate_windows".to_string(), value);
        patch.insert(
            "codex_rate_windows_at".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
    }
    patch
}

/// Account state transitions driven by upstream responses.
#[async_trait]
pub trait RateLimitService: Send + Sync {
    /// Ingest a failed upstream response (status ≥ 400 in the failover
    /// class). May transition the account's schedule state.
    async fn ingest_failure(
        &self,
        account: &Account,
        model: &str,
        status: u16,
        headers: &HeaderMap,
    );

    /// Ingest usage headers after an OAuth response. The extra-map write
    /// happens asynchronously; the hot path never waits on it.
    fn ingest_headers(&self, account: &Account, headers: &HeaderMap);

    /// An SSE stream stalled past the data-interval watchdog.
    async fn note_stream_timeout(&self, account_id: Uuid);
}

/// Default implementation writing through the account store.
pub struct AccountRateLimiter {
    accounts: Arc<dyn AccountStore>,
}

impl AccountRateLimiter {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    fn retry_hold(headers: &HeaderMap) -> Duration {
        header_u64(headers, "retry-after")
            .or_else(|| header_u64(headers, "x-codex-primary-reset-after-seconds"))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RATE_LIMIT_HOLD)
    }
}

#[async_trait]
impl RateLimitService for AccountRateLimiter {
    async fn ingest_failure(
        &self,
        account: &Account,
        model: &str,
        status: u16,
        headers: &HeaderMap,
    ) {
        let result = match status {
            429 => {
                let until = Utc::now()
                    + chrono::Duration::from_std(Self::retry_hold(headers))
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let per_model = self
                    .accounts
                    .set_model_rate_limit(account.id, model, until)
                    .await;
                if let Err(e) = per_model {
                    tracing::warn!(account_id = %account.id, error = %e, "model rate-limit write failed");
                }
                self.accounts
                    .update_schedule_state(account.id, ScheduleState::RateLimited)
                    .await
            }
            402 => {
                self.accounts
                    .update_schedule_state(account.id, ScheduleState::Disabled)
                    .await
            }
            401 | 403 => {
                self.accounts
                    .update_schedule_state(account.id, ScheduleState::Error)
                    .await
            }
            529 => {
                self.accounts
                    .update_schedule_state(account.id, ScheduleState::Overloaded)
                    .await
            }
            s if s >= 500 => {
                self.accounts
                    .update_schedule_state(account.id, ScheduleState::Overloaded)
                    .await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(account_id = %account.id, status, error = %e, "schedule state write failed");
        }

        self.ingest_headers(account, headers);
    }

    fn ingest_headers(&self, account: &Account, headers: &HeaderMap) {
        let parsed = parse_codex_headers(headers);
        if parsed.is_empty() {
            return;
        }
        let patch = extra_patch(&parsed);
        let accounts = Arc::clone(&self.accounts);
        let account_id = account.id;
        tokio::spawn(async move {
            if let Err(e) = accounts.update_extra(account_id, patch).await {
                tracing::warn!(%account_id, error = %e, "rate window extra write failed");
            }
        });
    }

    async fn note_stream_timeout(&self, account_id: Uuid) {
        if let Err(e) = self
            .accounts
            .update_schedule_state(account_id, ScheduleState::Overloaded)
            .await
        {
            tracing::warn!(%account_id, error = %e, "stream timeout state write failed");
        }
    }
}
