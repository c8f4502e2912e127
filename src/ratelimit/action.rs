//! Turning verdicts into something a transport can act on.

use std::future::Future;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::limiter::RateLimiter;
use super::result::RateLimitResult;
use super::rules::Action;

/// Used for a redirect verdict that names no target. Rules cannot produce
/// one, but `RateLimitResult` is plain data and callers may build their own.
const DEFAULT_REDIRECT_TARGET: &str = "/";

/// What the transport should do with a checked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforcement {
    /// Serve the request.
    Proceed,
    /// Refuse with 429.
    Reject { retry_after: Option<Duration> },
    /// Wait, then serve the request.
    Delay(Duration),
    /// Ask the client to prove itself, 403.
    Challenge {
        challenge_id: Uuid,
        retry_after: Option<Duration>,
    },
    /// Send the client elsewhere, 307.
    Redirect { target: String },
}

impl Enforcement {
    /// Recommended HTTP status for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            Enforcement::Proceed | Enforcement::Delay(_) => 200,
            Enforcement::Reject { .. } => 429,
            Enforcement::Challenge { .. } => 403,
            Enforcement::Redirect { .. } => 307,
        }
    }

    /// True when the request will eventually be served.
    pub fn proceeds(&self) -> bool {
        matches!(self, Enforcement::Proceed | Enforcement::Delay(_))
    }
}

impl From<&RateLimitResult> for Enforcement {
    fn from(result: &RateLimitResult) -> Self {
        if result.allowed {
            return Enforcement::Proceed;
        }

        match result.action {
            Action::Allow => Enforcement::Proceed,
            Action::Block => Enforcement::Reject {
                retry_after: result.retry_after,
            },
            Action::Delay => Enforcement::Delay(result.delay.unwrap_or(Duration::from_secs(1))),
            Action::Challenge => Enforcement::Challenge {
                challenge_id: Uuid::new_v4(),
                retry_after: result.retry_after,
            },
            Action::Redirect => Enforcement::Redirect {
                target: result
                    .redirect_target
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REDIRECT_TARGET.to_string()),
            },
        }
    }
}

/// Outcome of [`RateLimiter::guard`].
#[derive(Debug)]
pub enum Admission<T> {
    /// The handler ran and produced this value.
    Completed(T),
    /// The handler did not run.
    Rejected(Enforcement),
}

impl<T> Admission<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Admission::Completed(_))
    }
}

impl RateLimiter {
    /// Check the request and run `handler` only if it may proceed.
    ///
    /// A `Delay` verdict sleeps for the rule's delay before running the
    /// handler. Every other denial returns without calling it.
    pub async fn guard<F, Fut, T>(
        &self,
        identifier: &str,
        endpoint: &str,
        cost: u32,
        handler: F,
    ) -> Admission<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let result = self.check(identifier, endpoint, cost).await;

        match Enforcement::from(&result) {
            Enforcement::Proceed => Admission::Completed(handler().await),
            Enforcement::Delay(delay) => {
                debug!(rule = %result.rule, delay_ms = delay.as_millis() as u64, "Delaying request");
                tokio::time::sleep(delay).await;
                Admission::Completed(handler().await)
            }
            enforcement => Admission::Rejected(enforcement),
        }
    }
}
