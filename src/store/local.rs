//! Process-local counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::mem::discriminant;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{BucketOutcome, BucketSpec, CounterStore, StoreResult};
use crate::ratelimit::{
    FixedWindow, FixedWindowCount, LeakyBucketState, SlidingLog, SlidingOutcome,
    TokenBucketState,
};

/// Counter state for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterEntry {
    Fixed(FixedWindowCount),
    Sliding(SlidingLog),
    TokenBucket(TokenBucketState),
    LeakyBucket(LeakyBucketState),
}

#[derive(Debug)]
struct Slot {
    entry: CounterEntry,
    expires_at_ms: u64,
    /// Set under the slot lock when the slot leaves the map.
    evicted: bool,
}

/// In-memory store with one lock per key.
///
/// The map itself is sharded, so checks on different keys never contend on
/// a single lock. Eviction takes the same per-key lock as a check and marks
/// the slot, and a check that finds its slot evicted starts over with a
/// fresh one.
///
/// `max_entries` is a soft bound. A full store frees a batch of keys in one
/// pass, and tasks that inserted new keys while that pass ran can leave the
/// store over the bound by at most one key per such task until the next
/// pass.
#[derive(Debug)]
pub struct LocalStore {
    entries: DashMap<String, Arc<Mutex<Slot>>>,
    max_entries: usize,
    /// Held for the duration of one eviction pass.
    eviction: Mutex<()>,
    eviction_passes: AtomicU64,
}

impl LocalStore {
    /// Create a store holding at most `max_entries` keys.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            eviction: Mutex::new(()),
            eviction_passes: AtomicU64::new(0),
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of times the store was full and had to free space.
    pub fn eviction_passes(&self) -> u64 {
        self.eviction_passes.load(Ordering::Relaxed)
    }

    /// Keys freed by one eviction pass.
    fn eviction_batch(&self) -> usize {
        (self.max_entries / 16).max(1)
    }

    /// Snapshot of the entry for `key`.
    pub fn get(&self, key: &str) -> Option<CounterEntry> {
        let slot = self.entries.get(key)?.clone();
        let slot = slot.lock();
        Some(slot.entry.clone())
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.retain(|_, slot| {
            slot.lock().evicted = true;
            false
        });
    }

    fn slot_for(&self, key: &str, now_ms: u64, fresh: &dyn Fn() -> CounterEntry) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.entries.get(key) {
            return slot.clone();
        }

        if self.entries.len() >= self.max_entries {
            self.make_room(now_ms);
        }

        self.entries
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, "Creating local counter");
                Arc::new(Mutex::new(Slot {
                    entry: fresh(),
                    expires_at_ms: now_ms,
                    evicted: false,
                }))
            })
            .clone()
    }

    /// Drop expired entries, then if the store is still near full drop the
    /// live entries closest to expiry until a batch of keys is free.
    fn make_room(&self, now_ms: u64) {
        let _pass = self.eviction.lock();
        if self.entries.len() < self.max_entries {
            // Another task freed space while this one waited
            return;
        }
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);

        let purged = self.purge(now_ms);
        let target = self.max_entries - self.eviction_batch();
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut candidates: Vec<(u64, String, Arc<Mutex<Slot>>)> = self
            .entries
            .iter()
            .map(|item| {
                let slot = item.value().clone();
                let expires_at = slot.lock().expires_at_ms;
                (expires_at, item.key().clone(), slot)
            })
            .collect();
        let excess = excess.min(candidates.len());
        if excess < candidates.len() {
            candidates.select_nth_unstable_by_key(excess, |(expires_at, _, _)| *expires_at);
        }

        let mut evicted = 0;
        for (_, key, slot) in candidates.into_iter().take(excess) {
            if self
                .entries
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot))
                .is_some()
            {
                slot.lock().evicted = true;
                evicted += 1;
            }
        }

        warn!(
            evicted = evicted,
            purged = purged,
            max_entries = self.max_entries,
            "Local store full, evicted live counters"
        );
    }

    fn purge(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            let mut slot = slot.lock();
            if slot.expires_at_ms <= now_ms {
                slot.evicted = true;
                false
            } else {
                true
            }
        });
        before.saturating_sub(self.entries.len())
    }

    /// Run `update` on the entry for `key` under its lock. `update` returns a
    /// value and the entry's new expiry time.
    fn with_entry<R>(
        &self,
        key: &str,
        now_ms: u64,
        fresh: impl Fn() -> CounterEntry,
        mut update: impl FnMut(&mut CounterEntry) -> (R, u64),
    ) -> R {
        loop {
            let slot = self.slot_for(key, now_ms, &fresh);
            let mut slot = slot.lock();
            if slot.evicted {
                continue;
            }

            let replacement = fresh();
            if discriminant(&slot.entry) != discriminant(&replacement) {
                // The rule for this key switched strategy.
                slot.entry = replacement;
            }

            let (value, expires_at_ms) = update(&mut slot.entry);
            slot.expires_at_ms = expires_at_ms;
            return value;
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn incr_fixed(
        &self,
        key: &str,
        cost: u64,
        window: FixedWindow,
        now_ms: u64,
    ) -> StoreResult<u64> {
        Ok(self.with_entry(
            key,
            now_ms,
            || CounterEntry::Fixed(FixedWindowCount { window, count: 0 }),
            |entry| match entry {
                CounterEntry::Fixed(counter) => (counter.charge(window, cost), window.end_ms),
                _ => unreachable!("entry kind checked by with_entry"),
            },
        ))
    }

    async fn record_sliding(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        cost: u64,
    ) -> StoreResult<SlidingOutcome> {
        Ok(self.with_entry(
            key,
            now_ms,
            || CounterEntry::Sliding(SlidingLog::new()),
            |entry| match entry {
                CounterEntry::Sliding(log) => {
                    let outcome = log.record(now_ms, window_ms, limit, cost);
                    let expires_at = log
                        .newest_ms()
                        .map_or(now_ms, |newest| newest.saturating_add(window_ms));
                    (outcome, expires_at)
                }
                _ => unreachable!("entry kind checked by with_entry"),
            },
        ))
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<BucketOutcome> {
        Ok(self.with_entry(
            key,
            now_ms,
            || CounterEntry::TokenBucket(TokenBucketState::full(spec, now_ms)),
            |entry| match entry {
                CounterEntry::TokenBucket(bucket) => {
                    bucket.capacity = spec.capacity;
                    bucket.refill_rate = spec.rate;
                    let allowed = bucket.consume_at(cost, now_ms);
                    let outcome = BucketOutcome {
                        allowed,
                        level: bucket.level,
                    };
                    (outcome, bucket.idle_expiry_ms())
                }
                _ => unreachable!("entry kind checked by with_entry"),
            },
        ))
    }

    async fn fill_leaky(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<BucketOutcome> {
        Ok(self.with_entry(
            key,
            now_ms,
            || CounterEntry::LeakyBucket(LeakyBucketState::empty(spec, now_ms)),
            |entry| match entry {
                CounterEntry::LeakyBucket(bucket) => {
                    bucket.capacity = spec.capacity;
                    bucket.leak_rate = spec.rate;
                    let allowed = bucket.add_at(cost, now_ms);
                    let outcome = BucketOutcome {
                        allowed,
                        level: bucket.level,
                    };
                    (outcome, bucket.idle_expiry_ms())
                }
                _ => unreachable!("entry kind checked by with_entry"),
            },
        ))
    }

    async fn purge_expired(&self, now_ms: u64) -> StoreResult<usize> {
        let removed = self.purge(now_ms);
        if removed > 0 {
            debug!(removed = removed, remaining = self.len(), "Purged expired local counters");
        }
        Ok(removed)
    }
}
