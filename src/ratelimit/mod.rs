//! Rate limiting rules, algorithms and the admission orchestrator.

mod action;
mod bucket;
mod cleanup;
mod limiter;
mod matcher;
mod metrics;
pub mod result;
pub mod rules;
mod window;

pub use action::{Admission, Enforcement};
pub use bucket::{
    check_leaky_bucket, check_token_bucket, LeakyBucket, LeakyBucketState, TokenBucket,
    TokenBucketState,
};
pub use cleanup::{spawn_cleanup, CleanupHandle};
pub use limiter::{RateLimiter, WILDCARD_IDENTIFIER};
pub use matcher::RuleMatcher;
pub use metrics::{Metrics, MetricsSnapshot};
pub use result::{RateLimitResult, UNLIMITED_REMAINING};
pub use rules::{Action, RateLimitRule, RuleConfig, Strategy, UNLIMITED_RULE_NAME};
pub use window::{FixedWindow, FixedWindowCount, SlidingLog, SlidingOutcome, WindowCounter};
