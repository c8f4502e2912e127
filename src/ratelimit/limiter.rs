//! The admission-control orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::bucket::{check_leaky_bucket, check_token_bucket};
use super::matcher::RuleMatcher;
use super::metrics::Metrics;
use super::result::RateLimitResult;
use super::rules::{RateLimitRule, Strategy};
use super::window::WindowCounter;
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterSettings;
use crate::store::{counter_key, CounterStore, LocalStore, StoreError, StoreResult};

/// Identifier used when the caller supplies none.
pub const WILDCARD_IDENTIFIER: &str = "*";

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Probes run off the request path and may have to open a connection.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Matches each request to a rule, runs the rule's algorithm against a
/// counter store and returns the verdict.
///
/// With a distributed store attached, that store is the primary. If it fails
/// or times out the limiter either answers from the local store
/// (graceful degradation, the default) or denies the request. Store errors
/// never reach the caller.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    matcher: RuleMatcher,
    local: Arc<LocalStore>,
    distributed: Option<Arc<dyn CounterStore>>,
    distributed_healthy: AtomicBool,
    graceful_degradation: bool,
    store_timeout: Duration,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.matcher.len())
            .field("distributed", &self.distributed.as_ref().map(|s| s.name()))
            .field("graceful_degradation", &self.graceful_degradation)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl RateLimiter {
    /// Create a local-only limiter with default settings.
    pub fn new(matcher: RuleMatcher) -> Self {
        let settings = LimiterSettings::default();
        Self {
            matcher,
            local: Arc::new(LocalStore::new(settings.local_store_max_entries)),
            distributed: None,
            distributed_healthy: AtomicBool::new(true),
            graceful_degradation: settings.graceful_degradation,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            metrics: Metrics::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Apply global settings. Replaces the local store.
    pub fn with_settings(mut self, settings: &LimiterSettings) -> Self {
        self.graceful_degradation = settings.graceful_degradation;
        self.local = Arc::new(LocalStore::new(settings.local_store_max_entries));
        self
    }

    /// Use `store` as the primary counter store, bounding each call by `timeout`.
    pub fn with_distributed(mut self, store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        self.distributed = Some(store);
        self.store_timeout = timeout;
        self.distributed_healthy.store(true, Ordering::SeqCst);
        self
    }

    /// Attach a distributed store that is not reachable yet. Checks use the
    /// degradation path until a health check succeeds.
    pub fn with_distributed_pending(
        mut self,
        store: Arc<dyn CounterStore>,
        timeout: Duration,
    ) -> Self {
        self = self.with_distributed(store, timeout);
        self.distributed_healthy.store(false, Ordering::SeqCst);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check whether `identifier` may make a request of `cost` to `endpoint`.
    ///
    /// Never fails: backend trouble is absorbed according to the graceful
    /// degradation setting.
    pub async fn check(&self, identifier: &str, endpoint: &str, cost: u32) -> RateLimitResult {
        self.metrics.record_request();

        let cost = u64::from(cost.max(1));
        let identifier = if identifier.is_empty() {
            WILDCARD_IDENTIFIER
        } else {
            identifier
        };
        let endpoint = if endpoint.is_empty() { "/" } else { endpoint };
        let now_ms = self.clock.now_ms();

        let rule = self.matcher.match_endpoint(endpoint);
        if rule.is_unlimited() {
            trace!(endpoint = %endpoint, "No rule matched, request unlimited");
            return RateLimitResult::unlimited(now_ms);
        }

        let key = counter_key(rule.name(), identifier);
        trace!(
            rule = %rule.name(),
            key = %key,
            cost = cost,
            strategy = rule.strategy().as_str(),
            "Checking rate limit"
        );

        let result = match &self.distributed {
            Some(store) => {
                self.check_distributed(store.as_ref(), &rule, &key, cost, now_ms)
                    .await
            }
            None => self.check_local(&rule, &key, cost, now_ms).await,
        };

        if !result.allowed {
            self.metrics.record_denial(result.action);
            debug!(
                rule = %rule.name(),
                key = %key,
                action = result.action.as_str(),
                retry_after_ms = result.retry_after.map(|d| d.as_millis() as u64),
                "Rate limit exceeded"
            );
        }

        result
    }

    async fn check_distributed(
        &self,
        store: &dyn CounterStore,
        rule: &RateLimitRule,
        key: &str,
        cost: u64,
        now_ms: u64,
    ) -> RateLimitResult {
        if self.distributed_healthy.load(Ordering::Acquire) {
            let call = evaluate(store, rule, key, cost, now_ms);
            match tokio::time::timeout(self.store_timeout, call).await {
                Ok(Ok(result)) => return result,
                Ok(Err(err)) if err.is_unavailable() => self.mark_unhealthy(store, &err),
                Ok(Err(err)) => {
                    // Confined to this key, the store stays in service.
                    self.metrics.record_backend_error();
                    warn!(
                        store = store.name(),
                        rule = %rule.name(),
                        key = %key,
                        error = %err,
                        "Distributed store rejected check"
                    );
                }
                Err(_) => self.mark_unhealthy(store, &StoreError::Timeout(self.store_timeout)),
            }
        }

        if !self.graceful_degradation {
            error!(
                rule = %rule.name(),
                key = %key,
                "Distributed store unavailable, failing closed"
            );
            return RateLimitResult::unavailable(rule, now_ms);
        }

        self.metrics.record_degraded();
        debug!(rule = %rule.name(), key = %key, "Serving check from local store");
        let mut result = self.check_local(rule, key, cost, now_ms).await;
        result.degraded = true;
        result
    }

    async fn check_local(
        &self,
        rule: &RateLimitRule,
        key: &str,
        cost: u64,
        now_ms: u64,
    ) -> RateLimitResult {
        match evaluate(self.local.as_ref(), rule, key, cost, now_ms).await {
            Ok(result) => result,
            Err(err) => {
                error!(rule = %rule.name(), key = %key, error = %err, "Local store failed");
                RateLimitResult::unavailable(rule, now_ms)
            }
        }
    }

    fn mark_unhealthy(&self, store: &dyn CounterStore, err: &StoreError) {
        self.metrics.record_backend_error();
        if self.distributed_healthy.swap(false, Ordering::AcqRel) {
            warn!(
                store = store.name(),
                error = %err,
                graceful_degradation = self.graceful_degradation,
                "Distributed store failed, degrading until it recovers"
            );
        }
    }

    /// Ping the distributed store and update its health.
    ///
    /// Returns `None` when no distributed store is attached. This is the
    /// only path that brings an unhealthy store back.
    pub async fn probe_distributed(&self) -> Option<bool> {
        let store = self.distributed.as_ref()?;
        let timeout = self.store_timeout.max(MIN_PROBE_TIMEOUT);
        let healthy = matches!(
            tokio::time::timeout(timeout, store.ping()).await,
            Ok(Ok(()))
        );

        let was_healthy = self.distributed_healthy.swap(healthy, Ordering::AcqRel);
        match (was_healthy, healthy) {
            (false, true) => info!(store = store.name(), "Distributed store recovered"),
            (true, false) => warn!(store = store.name(), "Distributed store probe failed"),
            _ => {}
        }
        Some(healthy)
    }

    /// Evict expired counters from every store. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut removed = self.local.purge_expired(now_ms).await.unwrap_or(0);

        if let Some(store) = &self.distributed {
            if self.distributed_healthy.load(Ordering::Acquire) {
                match store.purge_expired(now_ms).await {
                    Ok(n) => removed += n,
                    Err(err) => warn!(store = store.name(), error = %err, "Purge failed"),
                }
            }
        }
        removed
    }

    pub fn is_distributed_healthy(&self) -> bool {
        self.distributed.is_some() && self.distributed_healthy.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn graceful_degradation(&self) -> bool {
        self.graceful_degradation
    }
}

/// Run the algorithm named by `rule` against `store`.
async fn evaluate(
    store: &dyn CounterStore,
    rule: &RateLimitRule,
    key: &str,
    cost: u64,
    now_ms: u64,
) -> StoreResult<RateLimitResult> {
    match rule.strategy() {
        Strategy::FixedWindow => {
            WindowCounter::check_fixed_window(store, key, rule, cost, now_ms).await
        }
        Strategy::SlidingWindow => {
            WindowCounter::check_sliding_window(store, key, rule, cost, now_ms).await
        }
        Strategy::TokenBucket => check_token_bucket(store, key, rule, cost, now_ms).await,
        Strategy::LeakyBucket => check_leaky_bucket(store, key, rule, cost, now_ms).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::result::{HEADER_RETRY_AFTER, UNAVAILABLE_MESSAGE, UNLIMITED_REMAINING};
    use crate::ratelimit::rules::{Action, RuleConfig};
    use crate::store::testing::{BadKeyStore, FailingStore, SlowStore};
    use futures::future::join_all;

    const START_MS: u64 = 1_700_000_000_000;

    fn limiter(rules: &[RuleConfig]) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(START_MS);
        let matcher = RuleMatcher::from_configs(rules).unwrap();
        let limiter = RateLimiter::new(matcher).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn login_rule() -> RuleConfig {
        RuleConfig::new("login", "/auth/login", 5, 300, Strategy::FixedWindow)
    }

    #[tokio::test]
    async fn test_fixed_window_login_scenario() {
        let (limiter, clock) = limiter(&[login_rule()]);

        for i in 1..=5 {
            let result = limiter.check("1.2.3.4", "/auth/login", 1).await;
            assert!(result.allowed, "request {} should be allowed", i);
            assert_eq!(result.remaining, 5 - i);
            clock.advance(Duration::from_millis(150));
        }

        let result = limiter.check("1.2.3.4", "/auth/login", 1).await;
        assert!(!result.allowed);
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.remaining, 0);
        let retry = result.retry_after.unwrap();
        assert!(retry <= Duration::from_secs(300));
        assert!(result.headers.contains_key(HEADER_RETRY_AFTER));

        // Another client is unaffected
        assert!(limiter.check("5.6.7.8", "/auth/login", 1).await.allowed);

        // The next aligned window starts fresh
        clock.advance(retry);
        assert!(limiter.check("1.2.3.4", "/auth/login", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_at_aligned_boundary() {
        let (limiter, clock) = limiter(&[RuleConfig::new("api", "/api", 2, 60, Strategy::FixedWindow)]);
        // Align to 10s before a minute boundary
        clock.set_ms(1_700_000_040_000 + 50_000);

        assert!(limiter.check("c", "/api", 1).await.allowed);
        let second = limiter.check("c", "/api", 1).await;
        assert!(second.allowed);
        assert_eq!(second.reset_at.timestamp_millis(), 1_700_000_100_000);
        assert!(!limiter.check("c", "/api", 1).await.allowed);

        clock.set_ms(1_700_000_100_000);
        assert!(limiter.check("c", "/api", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_scenario() {
        let rule = RuleConfig::new("burst", "/burst", 10, 10, Strategy::TokenBucket);
        let (limiter, clock) = limiter(&[rule]);

        for i in 1..=10 {
            assert!(limiter.check("k", "/burst", 1).await.allowed, "request {}", i);
        }
        let denied = limiter.check("k", "/burst", 1).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(5));
        for i in 1..=5 {
            assert!(limiter.check("k", "/burst", 1).await.allowed, "refill {}", i);
        }
        assert!(!limiter.check("k", "/burst", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_scenario() {
        let rule = RuleConfig::new("search", "/search", 3, 10, Strategy::SlidingWindow);
        let (limiter, clock) = limiter(&[rule]);

        for _ in 0..3 {
            assert!(limiter.check("k", "/search", 1).await.allowed);
        }

        clock.advance(Duration::from_secs(9));
        let denied = limiter.check("k", "/search", 1).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(2));
        let allowed = limiter.check("k", "/search", 1).await;
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 2);
    }

    #[tokio::test]
    async fn test_leaky_bucket_through_limiter() {
        let rule = RuleConfig::new("queue", "/queue", 4, 4, Strategy::LeakyBucket)
            .with_action(Action::Delay)
            .with_delay_seconds(2);
        let (limiter, clock) = limiter(&[rule]);

        assert!(limiter.check("k", "/queue", 3).await.allowed);
        let denied = limiter.check("k", "/queue", 2).await;
        assert!(!denied.allowed);
        assert_eq!(denied.action, Action::Delay);
        assert_eq!(denied.delay, Some(Duration::from_secs(2)));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check("k", "/queue", 2).await.allowed);
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_is_unlimited() {
        let (limiter, _clock) = limiter(&[login_rule()]);

        for _ in 0..100 {
            let result = limiter.check("1.2.3.4", "/unregistered", 1).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, UNLIMITED_REMAINING);
        }
        assert!(limiter.local_store().is_empty());
        assert_eq!(limiter.metrics().snapshot().total_requests, 100);
    }

    #[tokio::test]
    async fn test_zero_cost_counts_as_one() {
        let (limiter, _clock) = limiter(&[login_rule()]);

        let result = limiter.check("ip", "/auth/login", 0).await;
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_cost_is_all_or_nothing() {
        let rule = RuleConfig::new("bulk", "/bulk", 5, 60, Strategy::SlidingWindow);
        let (limiter, _clock) = limiter(&[rule]);

        assert!(limiter.check("k", "/bulk", 3).await.allowed);
        let denied = limiter.check("k", "/bulk", 3).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 2);
        assert!(limiter.check("k", "/bulk", 2).await.allowed);
    }

    #[tokio::test]
    async fn test_empty_identifier_uses_wildcard_key() {
        let (limiter, _clock) = limiter(&[login_rule()]);

        limiter.check("", "/auth/login", 1).await;
        assert!(limiter.local_store().get("login:*").is_some());
    }

    #[tokio::test]
    async fn test_denials_update_action_metrics() {
        let rules = [
            RuleConfig::new("a", "/a", 1, 60, Strategy::FixedWindow),
            RuleConfig::new("c", "/c", 1, 60, Strategy::FixedWindow).with_action(Action::Challenge),
            RuleConfig::new("r", "/r", 1, 60, Strategy::FixedWindow)
                .with_action(Action::Redirect)
                .with_redirect_target("/wait"),
            RuleConfig::new("d", "/d", 1, 60, Strategy::FixedWindow).with_action(Action::Delay),
            RuleConfig::new("m", "/m", 1, 60, Strategy::FixedWindow).with_action(Action::Allow),
        ];
        let (limiter, _clock) = limiter(&rules);

        for endpoint in ["/a", "/c", "/r", "/d", "/m"] {
            limiter.check("k", endpoint, 1).await;
            let second = limiter.check("k", endpoint, 1).await;
            assert_eq!(second.allowed, endpoint == "/m");
        }

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.total_requests, 10);
        assert_eq!(snapshot.blocked_requests, 1);
        assert_eq!(snapshot.challenge_requests, 1);
        assert_eq!(snapshot.redirect_requests, 1);
        assert_eq!(snapshot.rate_limited_requests, 1);
    }

    #[tokio::test]
    async fn test_allowed_iff_action_is_allow() {
        let rule = RuleConfig::new("c", "/c", 2, 60, Strategy::TokenBucket).with_action(Action::Challenge);
        let (limiter, _clock) = limiter(&[rule]);

        for _ in 0..5 {
            let result = limiter.check("k", "/c", 1).await;
            assert_eq!(result.allowed, result.action == Action::Allow);
        }
    }

    #[tokio::test]
    async fn test_graceful_degradation_falls_back_to_local() {
        let store = Arc::new(FailingStore::default());
        let (limiter, _clock) = limiter(&[login_rule()]);
        let limiter = limiter.with_distributed(store.clone(), Duration::from_millis(20));

        for _ in 0..5 {
            let result = limiter.check("1.2.3.4", "/auth/login", 1).await;
            assert!(result.allowed);
            assert!(result.degraded);
        }
        let result = limiter.check("1.2.3.4", "/auth/login", 1).await;
        assert!(!result.allowed);
        assert!(result.degraded);

        // Only the first call reached the broken store
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(!limiter.is_distributed_healthy());

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.backend_errors, 1);
        assert_eq!(snapshot.degraded_checks, 6);
    }

    #[tokio::test]
    async fn test_fail_closed_without_graceful_degradation() {
        let settings = LimiterSettings {
            graceful_degradation: false,
            ..LimiterSettings::default()
        };
        let (limiter, _clock) = limiter(&[login_rule()]);
        let limiter = limiter
            .with_settings(&settings)
            .with_distributed(Arc::new(FailingStore::default()), Duration::from_millis(20));

        let result = limiter.check("1.2.3.4", "/auth/login", 1).await;
        assert!(!result.allowed);
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.message, UNAVAILABLE_MESSAGE);
        assert!(result.retry_after.is_some());
        assert!(limiter.local_store().is_empty());
        assert_eq!(limiter.metrics().snapshot().blocked_requests, 1);
    }

    #[tokio::test]
    async fn test_slow_store_times_out_into_degradation() {
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(300),
            inner: LocalStore::default(),
        });
        let (limiter, _clock) = limiter(&[login_rule()]);
        let limiter = limiter.with_distributed(store.clone(), Duration::from_millis(20));

        let result = limiter.check("1.2.3.4", "/auth/login", 1).await;
        assert!(result.allowed);
        assert!(result.degraded);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_probe_restores_distributed_store() {
        let store = Arc::new(FailingStore::default());
        let (limiter, _clock) = limiter(&[login_rule()]);
        let limiter = limiter.with_distributed(store.clone(), Duration::from_millis(20));

        limiter.check("ip", "/auth/login", 1).await;
        assert!(!limiter.is_distributed_healthy());
        assert_eq!(limiter.probe_distributed().await, Some(false));

        store.recover();
        assert_eq!(limiter.probe_distributed().await, Some(true));
        assert!(limiter.is_distributed_healthy());

        // The store is consulted again after recovery
        limiter.check("ip", "/auth/login", 1).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_key_error_does_not_take_store_out_of_service() {
        let rule = RuleConfig::new("s", "/s", 5, 60, Strategy::SlidingWindow);
        let store = Arc::new(BadKeyStore::new("s:bad"));
        let (limiter, _clock) = limiter(&[rule]);
        let limiter = limiter.with_distributed(store.clone(), Duration::from_millis(50));

        let bad = limiter.check("bad", "/s", 1).await;
        assert!(bad.allowed);
        assert!(bad.degraded);
        assert!(limiter.is_distributed_healthy());

        let good = limiter.check("good", "/s", 1).await;
        assert!(!good.degraded);
        assert!(store.inner.get("s:good").is_some());

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.backend_errors, 1);
        assert_eq!(snapshot.degraded_checks, 1);
    }

    #[tokio::test]
    async fn test_pending_store_joins_after_health_check() {
        let store = Arc::new(FailingStore::default());
        let (limiter, _clock) = limiter(&[login_rule()]);
        let limiter = limiter.with_distributed_pending(store.clone(), Duration::from_millis(20));
        assert!(!limiter.is_distributed_healthy());

        // Skipped entirely while unreachable
        let result = limiter.check("ip", "/auth/login", 1).await;
        assert!(result.allowed);
        assert!(result.degraded);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.probe_distributed().await, Some(false));

        store.recover();
        assert_eq!(limiter.probe_distributed().await, Some(true));
        limiter.check("ip", "/auth/login", 1).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_healthy_distributed_store_is_primary() {
        let store = Arc::new(LocalStore::default());
        let (limiter, _clock) = limiter(&[login_rule()]);
        let limiter = limiter.with_distributed(store.clone(), Duration::from_millis(50));

        let result = limiter.check("ip", "/auth/login", 1).await;
        assert!(result.allowed);
        assert!(!result.degraded);
        assert!(store.get("login:ip").is_some());
        assert!(limiter.local_store().is_empty());
    }

    #[tokio::test]
    async fn test_probe_without_distributed_store() {
        let (limiter, _clock) = limiter(&[login_rule()]);
        assert_eq!(limiter.probe_distributed().await, None);
        assert!(!limiter.is_distributed_healthy());
    }

    #[tokio::test]
    async fn test_concurrent_checks_same_key_admit_exactly_limit() {
        let rule = RuleConfig::new("hot", "/hot", 10, 60, Strategy::FixedWindow);
        let (limiter, _clock) = limiter(&[rule]);
        let limiter = Arc::new(limiter);

        let tasks = (0..50).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check("same", "/hot", 1).await.allowed })
        });
        let allowed = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_purge_expired_through_limiter() {
        let (limiter, clock) = limiter(&[login_rule()]);
        limiter.check("a", "/auth/login", 1).await;
        limiter.check("b", "/auth/login", 1).await;
        assert_eq!(limiter.local_store().len(), 2);

        clock.advance(Duration::from_secs(301));
        assert_eq!(limiter.purge_expired().await, 2);
        assert!(limiter.local_store().is_empty());
    }
}
