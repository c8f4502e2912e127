//! The verdict returned for every check.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use super::rules::{Action, RateLimitRule, UNLIMITED_RULE_NAME};

/// `remaining` reported for endpoints without a limit.
pub const UNLIMITED_REMAINING: u64 = u64::MAX;

/// Message used when the limiter fails closed.
pub const UNAVAILABLE_MESSAGE: &str = "rate limiter unavailable";

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Convert fractional seconds to whole milliseconds, rounding up.
pub(crate) fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_nan() || secs <= 0.0 {
        0
    } else {
        (secs * 1000.0).ceil() as u64
    }
}

fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms.min(i64::MAX as u64) as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Raw counting outcome produced by a strategy, before the rule's action
/// is applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tally {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at_ms: u64,
    pub retry_after_ms: Option<u64>,
}

/// Outcome of a single admission check.
///
/// `allowed` is false exactly when `action` is not [`Action::Allow`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
    pub action: Action,
    pub message: String,
    pub headers: HashMap<String, String>,
    /// Name of the rule that produced this verdict
    pub rule: String,
    /// How long to hold the request when `action` is `Delay`
    pub delay: Option<Duration>,
    /// Where to send the caller when `action` is `Redirect`
    pub redirect_target: Option<String>,
    /// Whether the local fallback store produced this verdict
    pub degraded: bool,
}

impl RateLimitResult {
    /// Verdict for an endpoint no rule covers.
    pub fn unlimited(now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: UNLIMITED_REMAINING,
            limit: UNLIMITED_REMAINING,
            reset_at: ms_to_datetime(now_ms),
            retry_after: None,
            action: Action::Allow,
            message: String::new(),
            headers: HashMap::new(),
            rule: UNLIMITED_RULE_NAME.to_string(),
            delay: None,
            redirect_target: None,
            degraded: false,
        }
    }

    /// Fail-closed verdict used when no store could be consulted.
    pub(crate) fn unavailable(rule: &RateLimitRule, now_ms: u64) -> Self {
        let retry_after = Duration::from_secs(1);
        let mut headers = HashMap::new();
        headers.insert(
            HEADER_RETRY_AFTER.to_string(),
            retry_after.as_secs().to_string(),
        );

        Self {
            allowed: false,
            remaining: 0,
            limit: rule.max_requests(),
            reset_at: ms_to_datetime(now_ms.saturating_add(retry_after.as_millis() as u64)),
            retry_after: Some(retry_after),
            action: Action::Block,
            message: UNAVAILABLE_MESSAGE.to_string(),
            headers,
            rule: rule.name().to_string(),
            delay: None,
            redirect_target: None,
            degraded: false,
        }
    }

    /// Apply the rule's action to a counting outcome.
    pub(crate) fn from_tally(rule: &RateLimitRule, tally: Tally) -> Self {
        // A monitor-only rule counts but never denies.
        let denied = !tally.allowed && rule.action() != Action::Allow;
        let retry_after = if denied {
            tally.retry_after_ms.map(Duration::from_millis)
        } else {
            None
        };

        let mut headers = HashMap::new();
        headers.insert(HEADER_LIMIT.to_string(), tally.limit.to_string());
        headers.insert(HEADER_REMAINING.to_string(), tally.remaining.to_string());
        headers.insert(
            HEADER_RESET.to_string(),
            tally.reset_at_ms.div_ceil(1000).to_string(),
        );
        if let Some(retry) = retry_after {
            headers.insert(
                HEADER_RETRY_AFTER.to_string(),
                (retry.as_millis() as u64).div_ceil(1000).to_string(),
            );
        }

        let (action, message) = if denied {
            (rule.action(), rule.message().to_string())
        } else {
            (Action::Allow, String::new())
        };

        Self {
            allowed: !denied,
            remaining: tally.remaining,
            limit: tally.limit,
            reset_at: ms_to_datetime(tally.reset_at_ms),
            retry_after,
            action,
            message,
            headers,
            rule: rule.name().to_string(),
            delay: if action == Action::Delay { rule.delay() } else { None },
            redirect_target: if action == Action::Redirect {
                rule.redirect_target().map(str::to_string)
            } else {
                None
            },
            degraded: false,
        }
    }

    /// `Retry-After` in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| (d.as_millis() as u64).div_ceil(1000))
    }
}
