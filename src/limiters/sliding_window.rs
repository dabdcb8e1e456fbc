//! Sliding-window rate limiter.
//!
//! Each bucket key owns a set of fixed windows numbered by
//! `floor(time / duration)`. A decision looks at the current window and,
//! under the weighted policy, the share of the previous window that still
//! overlaps the sliding interval. Buckets are locked individually so
//! different identifiers never contend; the map of buckets has its own lock
//! and is only write-locked to insert or sweep.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::request::{RatelimitRequest, RatelimitResponse};
use super::window::{Bucket, BucketKey, Window};
use crate::error::Result;
use crate::settings::CountingPolicy;

/// Raise one window's counter to at least `counter`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetCounterRequest {
    pub key: BucketKey,
    pub sequence: i64,
    pub counter: i64,
}

impl SetCounterRequest {
    pub fn from_window(key: &BucketKey, window: &Window) -> Self {
        Self {
            key: key.clone(),
            sequence: window.sequence,
            counter: window.counter,
        }
    }
}

/// Result of a `take`: the decision plus the window snapshots it was made on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TakeOutcome {
    pub response: RatelimitResponse,
    pub current: Window,
    pub previous: Window,
    /// The current window reached its limit for the first time on this call
    pub saturated: bool,
}

#[derive(Debug)]
pub struct RateLimiter {
    policy: CountingPolicy,
    buckets: RwLock<HashMap<BucketKey, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(policy: CountingPolicy) -> Self {
        Self {
            policy,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CountingPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    fn get_bucket(&self, key: &BucketKey) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.read().get(key).cloned()
    }

    fn get_or_create_bucket(&self, key: &BucketKey) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.get_bucket(key) {
            return bucket;
        }
        // another writer may have inserted it between the two locks
        self.buckets
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Whether the previous and current windows exist locally.
    /// `(false, false)` means this node has never seen the key.
    pub fn check_windows(&self, req: &RatelimitRequest, time_ms: i64) -> (bool, bool) {
        let key = req.bucket_key();
        let Some(bucket) = self.get_bucket(&key) else {
            return (false, false);
        };
        let bucket = bucket.lock();
        let current = key.sequence_at(time_ms);
        (bucket.has_window(current - 1), bucket.has_window(current))
    }

    /// Lock the live bucket for `key`, creating it if needed. A bucket the
    /// sweeper unlinked between lookup and lock is skipped for a fresh one.
    fn with_bucket<T>(&self, key: &BucketKey, f: impl FnOnce(&mut Bucket) -> T) -> T {
        let mut bucket = self.get_or_create_bucket(key);
        loop {
            let mut guard = bucket.lock();
            if !guard.retired {
                return f(&mut *guard);
            }
            drop(guard);
            bucket = self.get_or_create_bucket(key);
        }
    }

    pub fn take(&self, req: &RatelimitRequest, time_ms: i64) -> Result<TakeOutcome> {
        req.validate()?;
        let key = req.bucket_key();
        let sequence = key.sequence_at(time_ms);
        let policy = self.policy;
        Ok(self.with_bucket(&key, |bucket| {
            let previous = bucket.window_mut(sequence - 1, key.duration_ms).clone();
            let current = bucket.window_mut(sequence, key.duration_ms);

            let estimate = match policy {
                CountingPolicy::FixedWindow => current.counter,
                CountingPolicy::WeightedSliding => {
                    let elapsed = (time_ms - current.start) as f64 / key.duration_ms as f64;
                    let carried = previous.counter as f64 * (1.0 - elapsed.clamp(0.0, 1.0));
                    // `as` saturates at the i64 bounds
                    (current.counter as f64 + carried).round() as i64
                }
            };
            let reset = current.end();

            if req.cost > req.limit.saturating_sub(estimate) {
                return TakeOutcome {
                    response: RatelimitResponse {
                        pass: false,
                        limit: req.limit,
                        remaining: req.limit.saturating_sub(estimate).max(0),
                        reset,
                        current: estimate,
                    },
                    current: current.clone(),
                    previous,
                    saturated: false,
                };
            }

            current.counter = current.counter.saturating_add(req.cost);
            let estimate = estimate.saturating_add(req.cost);
            let saturated = estimate >= req.limit && !current.mitigate_broadcasted;
            if saturated {
                current.mitigate_broadcasted = true;
                debug!("window {} of {} saturated", sequence, key);
            }

            TakeOutcome {
                response: RatelimitResponse {
                    pass: true,
                    limit: req.limit,
                    remaining: req.limit.saturating_sub(estimate).max(0),
                    reset,
                    current: estimate,
                },
                current: current.clone(),
                previous,
                saturated,
            }
        }))
    }

    /// Merge counters from a more authoritative view. Counters only move up;
    /// missing buckets and windows are created.
    pub fn set_counters(&self, updates: &[SetCounterRequest]) {
        for update in updates {
            self.with_bucket(&update.key, |bucket| {
                let window = bucket.window_mut(update.sequence, update.key.duration_ms);
                if update.counter > window.counter {
                    window.counter = update.counter;
                }
            });
        }
    }

    /// Replace a window outright with the origin's copy
    pub fn set_window(&self, key: &BucketKey, window: Window) {
        self.with_bucket(key, |bucket| {
            bucket.windows.insert(window.sequence, window);
        });
    }

    pub fn peek_window(&self, key: &BucketKey, sequence: i64) -> Option<Window> {
        let bucket = self.get_bucket(key)?;
        let bucket = bucket.lock();
        bucket.window(sequence).cloned()
    }

    /// Sweep expired windows, then empty buckets. Returns buckets removed.
    pub fn expire_windows(&self, now_ms: i64) -> usize {
        let buckets: Vec<Arc<Mutex<Bucket>>> = self.buckets.read().values().cloned().collect();
        let mut windows_removed = 0;
        for bucket in buckets {
            windows_removed += bucket.lock().expire(now_ms);
        }

        let mut map = self.buckets.write();
        let before = map.len();
        // a bucket refilled since the sweep above is kept
        map.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            bucket.retired = bucket.is_empty();
            !bucket.retired
        });
        let buckets_removed = before - map.len();
        debug!(
            "Expired {} windows and {} buckets, {} buckets remain",
            windows_removed,
            buckets_removed,
            map.len()
        );
        buckets_removed
    }
}
