//! Window bookkeeping for the sliding-window limiter
use std::collections::BTreeMap;
use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Identity of a bucket: the same identifier under a different limit or
/// duration gets a fresh bucket so old sequence numbers are never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Encode, Decode)]
pub struct BucketKey {
    pub identifier: String,
    pub limit: i64,
    pub duration_ms: i64,
}

impl BucketKey {
    pub fn new(identifier: &str, limit: i64, duration_ms: i64) -> Self {
        Self {
            identifier: identifier.to_string(),
            limit,
            duration_ms,
        }
    }

    pub fn sequence_at(&self, time_ms: i64) -> i64 {
        time_ms.div_euclid(self.duration_ms)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.identifier, self.limit, self.duration_ms)
    }
}

/// One fixed slice of time and the requests counted in it
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Encode, Decode)]
pub struct Window {
    pub sequence: i64,
    /// Epoch milliseconds
    pub start: i64,
    pub duration_ms: i64,
    pub counter: i64,
    pub mitigate_broadcasted: bool,
}

impl Window {
    pub fn new(sequence: i64, duration_ms: i64) -> Self {
        Self {
            sequence,
            start: sequence.saturating_mul(duration_ms),
            duration_ms,
            counter: 0,
            mitigate_broadcasted: false,
        }
    }

    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.duration_ms)
    }

    /// Still needed as someone's previous window until two durations past its start
    pub fn is_expired(&self, now_ms: i64) -> bool {
        (self.start as i128) + 2 * (self.duration_ms as i128) < now_ms as i128
    }
}

/// All live windows of one bucket key, by sequence
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    pub windows: BTreeMap<i64, Window>,
    /// Set once the sweeper has unlinked this bucket from the store
    pub retired: bool,
}

impl Bucket {
    pub fn window_mut(&mut self, sequence: i64, duration_ms: i64) -> &mut Window {
        self.windows
            .entry(sequence)
            .or_insert_with(|| Window::new(sequence, duration_ms))
    }

    pub fn window(&self, sequence: i64) -> Option<&Window> {
        self.windows.get(&sequence)
    }

    pub fn has_window(&self, sequence: i64) -> bool {
        self.windows.contains_key(&sequence)
    }

    /// Drop expired windows; returns how many were removed
    pub fn expire(&mut self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now_ms));
        before - self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_string() {
        let key = BucketKey::new("api-key-1", 10, 60_000);
        assert_eq!(key.to_string(), "api-key-1::10::60000");
        assert_ne!(key, BucketKey::new("api-key-1", 10, 1_000));
        assert_eq!(key.sequence_at(125_000), 2);
    }

    #[test]
    fn test_window_bounds() {
        let window = Window::new(3, 1_000);
        assert_eq!(window.start, 3_000);
        assert_eq!(window.end(), 4_000);
        assert!(!window.is_expired(5_000));
        assert!(window.is_expired(5_001));
    }

    #[test]
    fn test_window_bounds_near_overflow() {
        let window = Window::new(0, i64::MAX);
        assert_eq!(window.end(), i64::MAX);
        assert!(!window.is_expired(i64::MAX));

        let previous = Window::new(-1, i64::MAX);
        assert_eq!(previous.start, -i64::MAX);
        assert!(!previous.is_expired(1_000));

        let far = Window::new(i64::MAX / 2, 4);
        assert_eq!(far.start, i64::MAX);
        assert_eq!(far.end(), i64::MAX);
    }

    #[test]
    fn test_bucket_expire() {
        let mut bucket = Bucket::default();
        bucket.window_mut(1, 1_000).counter = 4;
        bucket.window_mut(5, 1_000).counter = 2;
        assert_eq!(bucket.expire(5_500), 1);
        assert!(!bucket.has_window(1));
        assert_eq!(bucket.window(5).map(|w| w.counter), Some(2));
        assert_eq!(bucket.expire(100_000), 1);
        assert!(bucket.is_empty());
    }
}
