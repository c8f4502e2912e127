//! Process-wide limiter counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::rules::Action;

/// Monotonic counters updated on every check.
///
/// They only go back to zero through [`Metrics::reset`].
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    challenge_requests: AtomicU64,
    redirect_requests: AtomicU64,
    degraded_checks: AtomicU64,
    backend_errors: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub rate_limited_requests: u64,
    pub challenge_requests: u64,
    pub redirect_requests: u64,
    pub degraded_checks: u64,
    pub backend_errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a denied check in the bucket for its action.
    pub(crate) fn record_denial(&self, action: Action) {
        let counter = match action {
            Action::Block => &self.blocked_requests,
            Action::Delay => &self.rate_limited_requests,
            Action::Challenge => &self.challenge_requests,
            Action::Redirect => &self.redirect_requests,
            Action::Allow => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_degraded(&self) {
        self.degraded_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            challenge_requests: self.challenge_requests.load(Ordering::Relaxed),
            redirect_requests: self.redirect_requests.load(Ordering::Relaxed),
            degraded_checks: self.degraded_checks.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter. Operator use only.
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.blocked_requests,
            &self.rate_limited_requests,
            &self.challenge_requests,
            &self.redirect_requests,
            &self.degraded_checks,
            &self.backend_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
