//! Token bucket and leaky bucket arithmetic.
//!
//! Both buckets track a fractional `level` that changes continuously with
//! time. A token bucket refills towards `capacity` and rejects when it cannot
//! cover the request; a leaky bucket drains towards zero and rejects when the
//! request would overflow it. The state types here are what the local store
//! keeps per key, and the distributed store's scripts mirror the same math.

use parking_lot::Mutex;
use std::sync::Arc;

use super::result::{secs_to_ms, RateLimitResult, Tally};
use super::rules::RateLimitRule;
use crate::clock::{Clock, SystemClock};
use crate::error::{GatekeeperError, Result};
use crate::store::{BucketSpec, CounterStore, StoreResult};

/// Slack for comparing fractional levels. Refill and drain add up many small
/// float steps, so a level earned exactly can land a hair short of it.
const LEVEL_EPSILON: f64 = 1e-9;

fn elapsed_secs(from_ms: u64, to_ms: u64) -> f64 {
    to_ms.saturating_sub(from_ms) as f64 / 1000.0
}

fn validate_bucket(capacity: u64, rate: f64, rate_name: &str) -> Result<()> {
    if capacity == 0 {
        return Err(GatekeeperError::Config(
            "bucket capacity must be positive".to_string(),
        ));
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err(GatekeeperError::Config(format!(
            "{} must be a positive finite number",
            rate_name
        )));
    }
    Ok(())
}

/// State of a token bucket at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketState {
    pub capacity: f64,
    pub refill_rate: f64,
    pub level: f64,
    pub last_refill_ms: u64,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn full(spec: BucketSpec, now_ms: u64) -> Self {
        Self {
            capacity: spec.capacity,
            refill_rate: spec.rate,
            level: spec.capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = elapsed_secs(self.last_refill_ms, now_ms);
        self.level = (self.level + elapsed * self.refill_rate).min(self.capacity);
        // Advanced on every call, rejected or not.
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    /// Refill, then take `tokens` if all of them are available.
    pub fn consume_at(&mut self, tokens: u64, now_ms: u64) -> bool {
        self.refill(now_ms);
        let tokens = tokens as f64;
        if self.level + LEVEL_EPSILON >= tokens {
            self.level = (self.level - tokens).max(0.0);
            true
        } else {
            false
        }
    }

    /// Level as of `now_ms`, without consuming.
    pub fn level_at(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.level
    }

    /// When the bucket will be indistinguishable from a fresh one.
    pub fn idle_expiry_ms(&self) -> u64 {
        let to_full = (self.capacity - self.level).max(0.0) / self.refill_rate;
        self.last_refill_ms.saturating_add(secs_to_ms(to_full))
    }
}

/// State of a leaky bucket at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakyBucketState {
    pub capacity: f64,
    pub leak_rate: f64,
    pub level: f64,
    pub last_leak_ms: u64,
}

impl LeakyBucketState {
    /// An empty bucket.
    pub fn empty(spec: BucketSpec, now_ms: u64) -> Self {
        Self {
            capacity: spec.capacity,
            leak_rate: spec.rate,
            level: 0.0,
            last_leak_ms: now_ms,
        }
    }

    fn leak(&mut self, now_ms: u64) {
        let elapsed = elapsed_secs(self.last_leak_ms, now_ms);
        self.level = (self.level - elapsed * self.leak_rate).max(0.0);
        self.last_leak_ms = self.last_leak_ms.max(now_ms);
    }

    /// Drain, then add `tokens` if they fit below capacity.
    pub fn add_at(&mut self, tokens: u64, now_ms: u64) -> bool {
        self.leak(now_ms);
        let tokens = tokens as f64;
        if self.level + tokens <= self.capacity + LEVEL_EPSILON {
            self.level = (self.level + tokens).min(self.capacity);
            true
        } else {
            false
        }
    }

    pub fn level_at(&mut self, now_ms: u64) -> f64 {
        self.leak(now_ms);
        self.level
    }

    /// When the bucket will have drained to zero.
    pub fn idle_expiry_ms(&self) -> u64 {
        self.last_leak_ms
            .saturating_add(secs_to_ms(self.level / self.leak_rate))
    }
}

/// A self-contained, thread-safe token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<TokenBucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket of `capacity` tokens refilling at `refill_rate`/sec.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self> {
        Self::with_clock(capacity, refill_rate, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: u64, refill_rate: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_bucket(capacity, refill_rate, "refill_rate")?;
        let spec = BucketSpec {
            capacity: capacity as f64,
            rate: refill_rate,
        };
        let state = TokenBucketState::full(spec, clock.now_ms());
        Ok(Self {
            state: Mutex::new(state),
            clock,
        })
    }

    /// Take `tokens` if available. Never partially consumes.
    pub fn consume(&self, tokens: u64) -> bool {
        let now = self.clock.now_ms();
        self.state.lock().consume_at(tokens, now)
    }

    /// Current number of tokens.
    pub fn level(&self) -> f64 {
        let now = self.clock.now_ms();
        self.state.lock().level_at(now)
    }

    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity
    }
}

/// A self-contained, thread-safe leaky bucket.
#[derive(Debug)]
pub struct LeakyBucket {
    state: Mutex<LeakyBucketState>,
    clock: Arc<dyn Clock>,
}

impl LeakyBucket {
    /// Create an empty bucket holding at most `capacity`, draining at `leak_rate`/sec.
    pub fn new(capacity: u64, leak_rate: f64) -> Result<Self> {
        Self::with_clock(capacity, leak_rate, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: u64, leak_rate: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_bucket(capacity, leak_rate, "leak_rate")?;
        let spec = BucketSpec {
            capacity: capacity as f64,
            rate: leak_rate,
        };
        let state = LeakyBucketState::empty(spec, clock.now_ms());
        Ok(Self {
            state: Mutex::new(state),
            clock,
        })
    }

    /// Queue `tokens` if they fit.
    pub fn add(&self, tokens: u64) -> bool {
        let now = self.clock.now_ms();
        self.state.lock().add_at(tokens, now)
    }

    pub fn level(&self) -> f64 {
        let now = self.clock.now_ms();
        self.state.lock().level_at(now)
    }

    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity
    }
}

/// Token bucket check for a rule against a counter store.
pub async fn check_token_bucket(
    store: &dyn CounterStore,
    key: &str,
    rule: &RateLimitRule,
    cost: u64,
    now_ms: u64,
) -> StoreResult<RateLimitResult> {
    let spec = BucketSpec {
        capacity: rule.burst_size() as f64,
        rate: rule.refill_rate(),
    };
    let outcome = store.take_tokens(key, spec, cost, now_ms).await?;
    let level = outcome.level.clamp(0.0, spec.capacity);

    let retry_after_ms = (!outcome.allowed).then(|| secs_to_ms((cost as f64 - level) / spec.rate));

    Ok(RateLimitResult::from_tally(
        rule,
        Tally {
            allowed: outcome.allowed,
            remaining: level.floor() as u64,
            limit: rule.burst_size(),
            reset_at_ms: now_ms.saturating_add(secs_to_ms((spec.capacity - level) / spec.rate)),
            retry_after_ms,
        },
    ))
}

/// Leaky bucket check for a rule against a counter store.
pub async fn check_leaky_bucket(
    store: &dyn CounterStore,
    key: &str,
    rule: &RateLimitRule,
    cost: u64,
    now_ms: u64,
) -> StoreResult<RateLimitResult> {
    let spec = BucketSpec {
        capacity: rule.max_requests() as f64,
        rate: rule.leak_rate(),
    };
    let outcome = store.fill_leaky(key, spec, cost, now_ms).await?;
    let level = outcome.level.clamp(0.0, spec.capacity);

    let retry_after_ms = (!outcome.allowed)
        .then(|| secs_to_ms((level + cost as f64 - spec.capacity) / spec.rate));

    Ok(RateLimitResult::from_tally(
        rule,
        Tally {
            allowed: outcome.allowed,
            remaining: (spec.capacity - level).floor() as u64,
            limit: rule.max_requests(),
            reset_at_ms: now_ms.saturating_add(secs_to_ms(level / spec.rate)),
            retry_after_ms,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const START_MS: u64 = 1_700_000_000_000;

    fn token_bucket(capacity: u64, rate: f64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new(START_MS);
        let bucket = TokenBucket::with_clock(capacity, rate, Arc::new(clock.clone())).unwrap();
        (bucket, clock)
    }

    fn leaky_bucket(capacity: u64, rate: f64) -> (LeakyBucket, ManualClock) {
        let clock = ManualClock::new(START_MS);
        let bucket = LeakyBucket::with_clock(capacity, rate, Arc::new(clock.clone())).unwrap();
        (bucket, clock)
    }

    #[test]
    fn test_token_bucket_burst_then_refill() {
        let (bucket, clock) = token_bucket(10, 1.0);

        for i in 1..=10 {
            assert!(bucket.consume(1), "consume {} should succeed", i);
        }
        assert!(!bucket.consume(1));

        clock.advance(Duration::from_secs(5));

        for i in 1..=5 {
            assert!(bucket.consume(1), "refilled consume {} should succeed", i);
        }
        assert!(!bucket.consume(1));
    }

    #[test]
    fn test_token_bucket_never_exceeds_capacity() {
        let (bucket, clock) = token_bucket(10, 2.0);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(bucket.level(), 10.0);
    }

    #[test]
    fn test_token_bucket_no_partial_consumption() {
        let (bucket, _clock) = token_bucket(5, 1.0);

        assert!(bucket.consume(3));
        assert!(!bucket.consume(3));
        assert_eq!(bucket.level(), 2.0);
    }

    #[test]
    fn test_token_bucket_refill_is_continuous() {
        let (bucket, clock) = token_bucket(10, 1.0);
        assert!(bucket.consume(10));

        clock.advance(Duration::from_millis(500));
        assert!((bucket.level() - 0.5).abs() < 1e-9);
        assert!(!bucket.consume(1));

        clock.advance(Duration::from_millis(500));
        assert!(bucket.consume(1));
    }

    #[test]
    fn test_token_bucket_fractional_rate_refills_fully() {
        // 0.3 tokens/s has no exact binary form
        let (bucket, clock) = token_bucket(3, 0.3);
        assert!(bucket.consume(3));

        for _ in 0..9 {
            clock.advance(Duration::from_secs(1));
            assert!(!bucket.consume(3));
        }

        clock.advance(Duration::from_secs(1));
        assert!(bucket.consume(3));
        assert!(bucket.level() >= 0.0);
    }

    #[test]
    fn test_leaky_bucket_fractional_rate_drains_fully() {
        let (bucket, clock) = leaky_bucket(3, 0.3);
        assert!(bucket.add(3));

        for _ in 0..9 {
            clock.advance(Duration::from_secs(1));
            assert!(!bucket.add(3));
        }

        clock.advance(Duration::from_secs(1));
        assert!(bucket.add(3));
        assert!(bucket.level() <= 3.0);
    }

    #[test]
    fn test_token_bucket_rejection_advances_refill_time() {
        let mut state = TokenBucketState::full(
            BucketSpec {
                capacity: 1.0,
                rate: 1.0,
            },
            START_MS,
        );
        assert!(state.consume_at(1, START_MS));
        assert!(!state.consume_at(1, START_MS + 400));
        assert_eq!(state.last_refill_ms, START_MS + 400);
        assert!((state.level - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_token_bucket_level_stays_in_bounds() {
        let (bucket, clock) = token_bucket(4, 3.0);
        for step in 0..200u64 {
            bucket.consume(step % 3 + 1);
            clock.advance(Duration::from_millis(step * 7 % 400));
            let level = bucket.level();
            assert!((0.0..=4.0).contains(&level), "level {} out of bounds", level);
        }
    }

    #[test]
    fn test_leaky_bucket_rejects_when_full() {
        let (bucket, _clock) = leaky_bucket(3, 1.0);

        assert!(bucket.add(1));
        assert!(bucket.add(2));
        assert!(!bucket.add(1));
        assert_eq!(bucket.level(), 3.0);
    }

    #[test]
    fn test_leaky_bucket_drains_over_time() {
        let (bucket, clock) = leaky_bucket(4, 2.0);

        assert!(bucket.add(4));
        assert!(!bucket.add(1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.level(), 2.0);
        assert!(bucket.add(2));
        assert!(!bucket.add(1));

        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.level(), 0.0);
    }

    #[test]
    fn test_leaky_bucket_level_stays_in_bounds() {
        let (bucket, clock) = leaky_bucket(5, 1.5);
        for step in 0..200u64 {
            bucket.add(step % 4 + 1);
            clock.advance(Duration::from_millis(step * 13 % 700));
            let level = bucket.level();
            assert!((0.0..=5.0).contains(&level), "level {} out of bounds", level);
        }
    }

    #[test]
    fn test_buckets_reject_invalid_parameters() {
        assert!(TokenBucket::new(0, 1.0).is_err());
        assert!(TokenBucket::new(10, 0.0).is_err());
        assert!(LeakyBucket::new(10, -1.0).is_err());
        assert!(LeakyBucket::new(10, f64::INFINITY).is_err());
    }

    #[test]
    fn test_idle_expiry() {
        let spec = BucketSpec {
            capacity: 10.0,
            rate: 2.0,
        };
        let mut token = TokenBucketState::full(spec, START_MS);
        assert_eq!(token.idle_expiry_ms(), START_MS);
        token.consume_at(4, START_MS);
        assert_eq!(token.idle_expiry_ms(), START_MS + 2_000);

        let mut leaky = LeakyBucketState::empty(spec, START_MS);
        leaky.add_at(6, START_MS);
        assert_eq!(leaky.idle_expiry_ms(), START_MS + 3_000);
    }
}
