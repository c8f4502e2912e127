//! Rate limit rule configuration and validation.
//!
//! Rules arrive as [`RuleConfig`] values (usually deserialized from YAML) and
//! are compiled into immutable [`RateLimitRule`]s. Compilation is where every
//! configuration error is caught; a compiled rule is always usable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Name of the synthetic rule returned when nothing matches.
pub const UNLIMITED_RULE_NAME: &str = "unlimited";

const DEFAULT_MESSAGE: &str = "Rate limit exceeded";
const DEFAULT_DELAY_SECS: u64 = 1;

/// Admission algorithm used by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
            Strategy::LeakyBucket => "leaky_bucket",
        }
    }
}

/// What the caller should do with a request once its rule is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Admit anyway. On a rule this makes the rule monitor-only.
    Allow,
    #[default]
    Block,
    Delay,
    Challenge,
    Redirect,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Block => "block",
            Action::Delay => "delay",
            Action::Challenge => "challenge",
            Action::Redirect => "redirect",
        }
    }
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

/// Serializable form of a rule, as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name, also the first segment of every counter key
    pub name: String,
    /// Regular expression matched against the start of the endpoint path
    pub pattern: String,
    /// Requests allowed per window (or bucket capacity)
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
    pub strategy: Strategy,
    #[serde(default)]
    pub action: Action,
    #[serde(default = "default_message")]
    pub message: String,
    /// Token bucket capacity; defaults to `max_requests`
    #[serde(default)]
    pub burst_size: Option<u64>,
    /// Token bucket refill in tokens/sec; defaults to `max_requests / window`
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Leaky bucket drain in tokens/sec; defaults to `max_requests / window`
    #[serde(default)]
    pub leak_rate: Option<f64>,
    #[serde(default)]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub redirect_target: Option<String>,
}

impl RuleConfig {
    /// Start a rule with the required fields; everything else takes defaults.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        max_requests: u64,
        window_secs: u64,
        strategy: Strategy,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            max_requests,
            window_secs,
            strategy,
            action: Action::default(),
            message: default_message(),
            burst_size: None,
            refill_rate: None,
            leak_rate: None,
            delay_seconds: None,
            redirect_target: None,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_burst_size(mut self, burst_size: u64) -> Self {
        self.burst_size = Some(burst_size);
        self
    }

    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = Some(refill_rate);
        self
    }

    pub fn with_leak_rate(mut self, leak_rate: f64) -> Self {
        self.leak_rate = Some(leak_rate);
        self
    }

    pub fn with_delay_seconds(mut self, delay_seconds: u64) -> Self {
        self.delay_seconds = Some(delay_seconds);
        self
    }

    pub fn with_redirect_target(mut self, target: impl Into<String>) -> Self {
        self.redirect_target = Some(target.into());
        self
    }

    /// Validate the configuration and build an immutable rule.
    pub fn compile(&self) -> Result<RateLimitRule> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(GatekeeperError::invalid_rule(&self.name, "name must not be empty"));
        }
        if self.pattern.is_empty() {
            return Err(GatekeeperError::invalid_rule(name, "pattern must not be empty"));
        }
        let matcher = Regex::new(&format!("^(?:{})", self.pattern)).map_err(|e| {
            GatekeeperError::invalid_rule(name, format!("malformed pattern '{}': {}", self.pattern, e))
        })?;

        if self.max_requests == 0 {
            return Err(GatekeeperError::invalid_rule(name, "max_requests must be positive"));
        }
        if self.window_secs == 0 {
            return Err(GatekeeperError::invalid_rule(name, "window_secs must be positive"));
        }
        if self.burst_size == Some(0) {
            return Err(GatekeeperError::invalid_rule(name, "burst_size must be positive"));
        }
        check_rate(name, "refill_rate", self.refill_rate)?;
        check_rate(name, "leak_rate", self.leak_rate)?;

        let redirect_target = match (self.action, &self.redirect_target) {
            (Action::Redirect, None) => {
                return Err(GatekeeperError::invalid_rule(
                    name,
                    "redirect action requires redirect_target",
                ));
            }
            (_, target) => target.clone(),
        };

        let default_rate = self.max_requests as f64 / self.window_secs as f64;
        let delay = match self.action {
            Action::Delay => Some(Duration::from_secs(
                self.delay_seconds.unwrap_or(DEFAULT_DELAY_SECS),
            )),
            _ => None,
        };

        Ok(RateLimitRule {
            name: name.to_string(),
            pattern: self.pattern.clone(),
            matcher: Some(matcher),
            max_requests: self.max_requests,
            window: Duration::from_secs(self.window_secs),
            strategy: self.strategy,
            action: self.action,
            message: self.message.clone(),
            burst_size: self.burst_size.unwrap_or(self.max_requests),
            refill_rate: self.refill_rate.unwrap_or(default_rate),
            leak_rate: self.leak_rate.unwrap_or(default_rate),
            delay,
            redirect_target,
            unlimited: false,
        })
    }
}

fn check_rate(rule: &str, field: &str, rate: Option<f64>) -> Result<()> {
    match rate {
        Some(r) if !r.is_finite() || r <= 0.0 => Err(GatekeeperError::invalid_rule(
            rule,
            format!("{} must be a positive finite number", field),
        )),
        _ => Ok(()),
    }
}

/// A validated, immutable rate limit rule.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    name: String,
    pattern: String,
    /// `None` only for the unlimited rule, which matches everything
    matcher: Option<Regex>,
    max_requests: u64,
    window: Duration,
    strategy: Strategy,
    action: Action,
    message: String,
    burst_size: u64,
    refill_rate: f64,
    leak_rate: f64,
    delay: Option<Duration>,
    redirect_target: Option<String>,
    unlimited: bool,
}

impl RateLimitRule {
    /// The catch-all rule used for endpoints no configured rule matches.
    pub fn unlimited() -> Self {
        Self {
            name: UNLIMITED_RULE_NAME.to_string(),
            pattern: String::new(),
            matcher: None,
            max_requests: u64::MAX,
            window: Duration::from_secs(1),
            strategy: Strategy::FixedWindow,
            action: Action::Allow,
            message: String::new(),
            burst_size: u64::MAX,
            refill_rate: f64::INFINITY,
            leak_rate: f64::INFINITY,
            delay: None,
            redirect_target: None,
            unlimited: true,
        }
    }

    /// Whether this rule's pattern matches the start of `endpoint`.
    pub fn matches(&self, endpoint: &str) -> bool {
        self.matcher.as_ref().map_or(true, |re| re.is_match(endpoint))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pattern as configured, before anchoring.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Token bucket capacity.
    pub fn burst_size(&self) -> u64 {
        self.burst_size
    }

    /// Token bucket refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Leaky bucket drain rate in tokens per second.
    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_target.as_deref()
    }

    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_reason(config: RuleConfig) -> String {
        match config.compile() {
            Err(GatekeeperError::InvalidRule { reason, .. }) => reason,
            other => panic!("expected InvalidRule, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rule_yaml() {
        let yaml = r#"
name: login
pattern: /auth/login
max_requests: 5
window_secs: 300
strategy: fixed_window
action: challenge
message: Too many login attempts
"#;
        let config: RuleConfig = serde_yaml::from_str(yaml).unwrap();
        let rule = config.compile().unwrap();

        assert_eq!(rule.name(), "login");
        assert_eq!(rule.max_requests(), 5);
        assert_eq!(rule.window(), Duration::from_secs(300));
        assert_eq!(rule.strategy(), Strategy::FixedWindow);
        assert_eq!(rule.action(), Action::Challenge);
        assert_eq!(rule.message(), "Too many login attempts");
    }

    #[test]
    fn test_defaults_for_omitted_fields() {
        let yaml = r#"
name: api
pattern: /api/
max_requests: 60
window_secs: 60
strategy: token_bucket
"#;
        let config: RuleConfig = serde_yaml::from_str(yaml).unwrap();
        let rule = config.compile().unwrap();

        assert_eq!(rule.action(), Action::Block);
        assert_eq!(rule.message(), "Rate limit exceeded");
        assert_eq!(rule.burst_size(), 60);
        assert!((rule.refill_rate() - 1.0).abs() < f64::EPSILON);
        assert!((rule.leak_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_explicit_bucket_parameters() {
        let rule = RuleConfig::new("upload", "/upload", 10, 60, Strategy::TokenBucket)
            .with_burst_size(20)
            .with_refill_rate(0.5)
            .compile()
            .unwrap();

        assert_eq!(rule.burst_size(), 20);
        assert!((rule.refill_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pattern_is_prefix_anchored() {
        let rule = RuleConfig::new("api", "/api/", 10, 60, Strategy::FixedWindow)
            .compile()
            .unwrap();

        assert!(rule.matches("/api/users"));
        assert!(!rule.matches("/v2/api/users"));

        let exact = RuleConfig::new("health", "/health$", 10, 60, Strategy::FixedWindow)
            .compile()
            .unwrap();
        assert!(exact.matches("/health"));
        assert!(!exact.matches("/healthz"));
    }

    #[test]
    fn test_delay_defaults_to_one_second() {
        let rule = RuleConfig::new("search", "/search", 10, 60, Strategy::SlidingWindow)
            .with_action(Action::Delay)
            .compile()
            .unwrap();
        assert_eq!(rule.delay(), Some(Duration::from_secs(1)));

        let blocking = RuleConfig::new("search", "/search", 10, 60, Strategy::SlidingWindow)
            .with_delay_seconds(5)
            .compile()
            .unwrap();
        assert_eq!(blocking.delay(), None);
    }

    #[test]
    fn test_rejects_malformed_pattern() {
        let reason = invalid_reason(RuleConfig::new("bad", "/api/(", 10, 60, Strategy::FixedWindow));
        assert!(reason.contains("malformed pattern"));
    }

    #[test]
    fn test_rejects_non_positive_values() {
        assert!(invalid_reason(RuleConfig::new("r", "/", 0, 60, Strategy::FixedWindow))
            .contains("max_requests"));
        assert!(invalid_reason(RuleConfig::new("r", "/", 10, 0, Strategy::FixedWindow))
            .contains("window_secs"));
        assert!(invalid_reason(
            RuleConfig::new("r", "/", 10, 60, Strategy::TokenBucket).with_refill_rate(0.0)
        )
        .contains("refill_rate"));
        assert!(invalid_reason(
            RuleConfig::new("r", "/", 10, 60, Strategy::LeakyBucket).with_leak_rate(f64::NAN)
        )
        .contains("leak_rate"));
        assert!(invalid_reason(
            RuleConfig::new("r", "/", 10, 60, Strategy::TokenBucket).with_burst_size(0)
        )
        .contains("burst_size"));
    }

    #[test]
    fn test_rejects_redirect_without_target() {
        let reason = invalid_reason(
            RuleConfig::new("r", "/", 10, 60, Strategy::FixedWindow).with_action(Action::Redirect),
        );
        assert!(reason.contains("redirect_target"));

        let rule = RuleConfig::new("r", "/", 10, 60, Strategy::FixedWindow)
            .with_action(Action::Redirect)
            .with_redirect_target("/slow-lane")
            .compile()
            .unwrap();
        assert_eq!(rule.redirect_target(), Some("/slow-lane"));
    }

    #[test]
    fn test_rejects_empty_name() {
        let reason = invalid_reason(RuleConfig::new("  ", "/", 10, 60, Strategy::FixedWindow));
        assert!(reason.contains("name"));
    }

    #[test]
    fn test_unlimited_rule_matches_everything() {
        let rule = RateLimitRule::unlimited();
        assert!(rule.is_unlimited());
        assert!(rule.matches("/anything/at/all"));
        assert!(rule.matches(""));
        assert_eq!(rule.name(), UNLIMITED_RULE_NAME);
    }
}
