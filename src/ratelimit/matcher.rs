//! Ordered, first-match-wins rule selection.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::rules::{RateLimitRule, RuleConfig};
use crate::error::{GatekeeperError, Result};

/// Selects the rule that governs an endpoint.
///
/// Rules are tried in registration order and the first whose pattern matches
/// wins. There is no priority field and no best-match scoring. Endpoints that
/// no rule covers get the synthetic unlimited rule, so an unconfigured
/// endpoint is never blocked.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    rules: Vec<Arc<RateLimitRule>>,
    names: HashSet<String>,
    unlimited: Arc<RateLimitRule>,
}

impl RuleMatcher {
    /// Create a matcher with no rules.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            names: HashSet::new(),
            unlimited: Arc::new(RateLimitRule::unlimited()),
        }
    }

    /// Build a matcher from rule configs, failing on the first invalid one.
    pub fn from_configs<'a, I>(configs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a RuleConfig>,
    {
        let mut matcher = Self::new();
        for config in configs {
            matcher.register(config)?;
        }
        info!(rules = matcher.len(), "Rule matcher built");
        Ok(matcher)
    }

    /// Validate and append a rule. It becomes active only if valid.
    pub fn register(&mut self, config: &RuleConfig) -> Result<()> {
        let rule = config.compile()?;
        if !self.names.insert(rule.name().to_string()) {
            return Err(GatekeeperError::DuplicateRule(rule.name().to_string()));
        }

        debug!(
            rule = %rule.name(),
            pattern = %config.pattern,
            strategy = rule.strategy().as_str(),
            max_requests = rule.max_requests(),
            window_secs = rule.window().as_secs(),
            "Registered rate limit rule"
        );
        self.rules.push(Arc::new(rule));
        Ok(())
    }

    /// Find the rule governing `endpoint`.
    pub fn match_endpoint(&self, endpoint: &str) -> Arc<RateLimitRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(endpoint))
            .unwrap_or(&self.unlimited)
            .clone()
    }

    /// Registered rules, in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self::new()
    }
}
