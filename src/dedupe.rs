//! Idempotency guard for inbound events.
//!
//! Emitters retry deliveries, so the same logical event can arrive several
//! times. The intake endpoint asks the store whether an event's
//! [`IdempotencyKey`] has been seen before deciding anything, and marks it
//! seen once the event has been fully handled.
//!
//! # Retention
//!
//! Keys are kept for a time window (default 24 hours) and the store holds at
//! most a fixed number of keys (default 100 000, oldest evicted first). Both
//! bounds keep a long-running process from growing without limit.
//!
//! # Concurrency
//!
//! `seen` followed by `mark_seen` is not atomic: two concurrent deliveries of
//! the same key can both observe "not seen". The task queue's deterministic
//! job IDs catch that case.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::types::IdempotencyKey;

/// Default TTL for idempotency keys (24 hours).
pub const DEFAULT_DEDUPE_TTL_HOURS: i64 = 24;

/// Longest accepted TTL (ten years).
pub const MAX_DEDUPE_TTL_HOURS: i64 = 24 * 365 * 10;

/// Default maximum number of tracked keys.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 100_000;

/// Storage for idempotency keys.
///
/// Implementations must be safe to call from concurrent request handlers.
pub trait IdempotencyStore: Send + Sync {
    /// Returns `true` if the key was recorded and has not expired.
    fn seen(&self, key: &IdempotencyKey) -> bool;

    /// Records the key as processed.
    fn mark_seen(&self, key: &IdempotencyKey);

    /// Number of keys currently tracked.
    fn len(&self) -> usize;

    /// Returns `true` if no keys are tracked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired keys, returning how many were removed.
    fn prune(&self) -> usize;
}

#[derive(Debug, Default)]
struct WindowState {
    /// Key -> first-seen time.
    keys: HashMap<String, DateTime<Utc>>,
    /// Insertion order, for capacity eviction. May hold stale entries for
    /// keys already pruned; those are skipped on eviction.
    order: VecDeque<(String, DateTime<Utc>)>,
}

/// In-process store bounded by both age and count.
#[derive(Debug)]
pub struct WindowedIdempotencyStore {
    ttl: Duration,
    capacity: usize,
    state: Mutex<WindowState>,
}

impl Default for WindowedIdempotencyStore {
    fn default() -> Self {
        Self::new(
            Duration::hours(DEFAULT_DEDUPE_TTL_HOURS),
            DEFAULT_DEDUPE_CAPACITY,
        )
    }
}

impl WindowedIdempotencyStore {
    /// Creates a store with the given TTL and capacity.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        WindowedIdempotencyStore {
            ttl,
            capacity: capacity.max(1),
            state: Mutex::new(WindowState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys first seen at or before this instant have expired. `None` when
    /// the window reaches back past the representable range.
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.ttl)
    }

    fn seen_at(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> bool {
        let cutoff = self.cutoff(now);
        self.lock()
            .keys
            .get(key.as_str())
            .is_some_and(|first_seen| cutoff.is_none_or(|c| *first_seen > c))
    }

    fn mark_seen_at(&self, key: &IdempotencyKey, now: DateTime<Utc>) {
        let mut state = self.lock();

        let cutoff = self.cutoff(now);
        let live = state
            .keys
            .get(key.as_str())
            .map(|first_seen| cutoff.is_none_or(|c| *first_seen > c));
        match live {
            Some(true) => return,
            // Expired but not yet pruned: the key starts a fresh window.
            Some(false) => {
                state.keys.remove(key.as_str());
            }
            None => {}
        }

        state.keys.insert(key.as_str().to_string(), now);
        state.order.push_back((key.as_str().to_string(), now));

        while state.keys.len() > self.capacity {
            let Some((oldest, ts)) = state.order.pop_front() else {
                break;
            };
            if state.keys.get(&oldest) == Some(&ts) {
                state.keys.remove(&oldest);
            }
        }
    }

    fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = self.cutoff(now) else {
            return 0;
        };
        let mut state = self.lock();
        let before_len = state.keys.len();
        state.keys.retain(|_, first_seen| *first_seen > cutoff);
        state.order.retain(|(_, ts)| *ts > cutoff);
        before_len - state.keys.len()
    }
}

impl IdempotencyStore for WindowedIdempotencyStore {
    fn seen(&self, key: &IdempotencyKey) -> bool {
        self.seen_at(key, Utc::now())
    }

    fn mark_seen(&self, key: &IdempotencyKey) {
        self.mark_seen_at(key, Utc::now());
    }

    fn len(&self) -> usize {
        self.lock().keys.len()
    }

    fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }
}
