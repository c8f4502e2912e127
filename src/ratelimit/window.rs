//! Fixed-window and sliding-window counting.
//!
//! Fixed windows are aligned to the Unix epoch, so every client of a rule
//! sees the same window edges. A burst straddling an edge can therefore admit
//! up to twice `max_requests` within one window length; rules that cannot
//! tolerate that should use the sliding window, which keeps an exact log of
//! admitted events.

use std::collections::VecDeque;

use super::result::{RateLimitResult, Tally};
use super::rules::RateLimitRule;
use crate::store::{CounterStore, StoreResult};

/// An epoch-aligned window `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl FixedWindow {
    /// The window containing `now_ms`.
    pub fn containing(now_ms: u64, window_ms: u64) -> Self {
        let window_ms = window_ms.max(1);
        let start_ms = (now_ms / window_ms) * window_ms;
        Self {
            start_ms,
            end_ms: start_ms + window_ms,
        }
    }

    pub fn contains(&self, now_ms: u64) -> bool {
        (self.start_ms..self.end_ms).contains(&now_ms)
    }
}

/// Fixed window counter state for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowCount {
    pub window: FixedWindow,
    pub count: u64,
}

impl FixedWindowCount {
    /// Charge `cost` to `window`, starting over if the window has moved on.
    pub fn charge(&mut self, window: FixedWindow, cost: u64) -> u64 {
        if self.window != window {
            self.window = window;
            self.count = 0;
        }
        self.count = self.count.saturating_add(cost);
        self.count
    }
}

/// Outcome of recording against a sliding log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingOutcome {
    pub allowed: bool,
    /// Events in the window after this check
    pub count: u64,
    /// Earliest time at which the same request would fit
    pub retry_at_ms: Option<u64>,
    /// Timestamp of the oldest event still in the window
    pub oldest_ms: Option<u64>,
}

/// Time-ordered log of admitted events for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlidingLog {
    events: VecDeque<u64>,
}

impl SlidingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop events at or before `now_ms - window_ms`.
    pub fn expire(&mut self, now_ms: u64, window_ms: u64) {
        let Some(cutoff) = now_ms.checked_sub(window_ms) else {
            return;
        };
        while self.events.front().is_some_and(|&ts| ts <= cutoff) {
            self.events.pop_front();
        }
    }

    /// Expire old events, then record `cost` events at `now_ms` if they all fit.
    pub fn record(&mut self, now_ms: u64, window_ms: u64, limit: u64, cost: u64) -> SlidingOutcome {
        self.expire(now_ms, window_ms);
        let count = self.events.len() as u64;

        if count + cost <= limit {
            // Timestamps only move forward within a log.
            let ts = self.events.back().map_or(now_ms, |&last| last.max(now_ms));
            self.events.extend(std::iter::repeat(ts).take(cost as usize));
            return SlidingOutcome {
                allowed: true,
                count: count + cost,
                retry_at_ms: None,
                oldest_ms: self.events.front().copied(),
            };
        }

        // The request fits once enough of the oldest events have expired.
        let must_expire = (count + cost - limit) as usize;
        let retry_at_ms = if cost <= limit {
            self.events
                .get(must_expire - 1)
                .map(|&ts| ts.saturating_add(window_ms))
        } else {
            None
        };

        SlidingOutcome {
            allowed: false,
            count,
            retry_at_ms: retry_at_ms.or(Some(now_ms.saturating_add(window_ms))),
            oldest_ms: self.events.front().copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Timestamp of the newest event, used for idle expiry.
    pub fn newest_ms(&self) -> Option<u64> {
        self.events.back().copied()
    }
}

/// Window strategies evaluated against any counter store.
pub struct WindowCounter;

impl WindowCounter {
    /// Charge `cost` to the epoch-aligned window containing `now_ms`.
    pub async fn check_fixed_window(
        store: &dyn CounterStore,
        key: &str,
        rule: &RateLimitRule,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<RateLimitResult> {
        let window = FixedWindow::containing(now_ms, rule.window_ms());
        let count = store.incr_fixed(key, cost, window, now_ms).await?;
        let allowed = count <= rule.max_requests();

        Ok(RateLimitResult::from_tally(
            rule,
            Tally {
                allowed,
                remaining: rule.max_requests().saturating_sub(count),
                limit: rule.max_requests(),
                reset_at_ms: window.end_ms,
                retry_after_ms: (!allowed).then(|| window.end_ms.saturating_sub(now_ms)),
            },
        ))
    }

    /// Count admitted events in `(now - window, now]`.
    pub async fn check_sliding_window(
        store: &dyn CounterStore,
        key: &str,
        rule: &RateLimitRule,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<RateLimitResult> {
        let window_ms = rule.window_ms();
        let outcome = store
            .record_sliding(key, now_ms, window_ms, rule.max_requests(), cost)
            .await?;

        let reset_at_ms = outcome
            .oldest_ms
            .map_or(now_ms, |oldest| oldest.saturating_add(window_ms));

        Ok(RateLimitResult::from_tally(
            rule,
            Tally {
                allowed: outcome.allowed,
                remaining: rule.max_requests().saturating_sub(outcome.count),
                limit: rule.max_requests(),
                reset_at_ms,
                retry_after_ms: outcome
                    .retry_at_ms
                    .filter(|_| !outcome.allowed)
                    .map(|at| at.saturating_sub(now_ms)),
            },
        ))
    }
}
