//! Metrics capability injected into the service.
//!
//! Every method is fire-and-forget and must stay cheap: they are called
//! from the request path.
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerState;

pub trait Metrics: Send + Sync {
    fn decision(&self, pass: bool);
    fn sync_enqueued(&self);
    fn sync_dropped(&self);
    fn sync_completed(&self);
    fn sync_failed(&self);
    /// Whether a local decision agreed with what the origin decided
    fn sync_accuracy(&self, matched: bool);
    fn origin_fallback(&self);
    fn mitigation_sent(&self);
    fn mitigation_received(&self);
    fn breaker_transition(&self, name: &str, from: BreakerState, to: BreakerState);
    fn ring_size(&self, nodes: usize);
    fn active_identifiers(&self, buckets: usize);
    fn queue_backlog(&self, delta: i64);
}

/// Metrics sink that discards everything
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn decision(&self, _pass: bool) {}
    fn sync_enqueued(&self) {}
    fn sync_dropped(&self) {}
    fn sync_completed(&self) {}
    fn sync_failed(&self) {}
    fn sync_accuracy(&self, _matched: bool) {}
    fn origin_fallback(&self) {}
    fn mitigation_sent(&self) {}
    fn mitigation_received(&self) {}
    fn breaker_transition(&self, _name: &str, _from: BreakerState, _to: BreakerState) {}
    fn ring_size(&self, _nodes: usize) {}
    fn active_identifiers(&self, _buckets: usize) {}
    fn queue_backlog(&self, _delta: i64) {}
}

/// In-process counters, exposed over the HTTP API as a snapshot
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    pub decisions_passed: AtomicU64,
    pub decisions_rejected: AtomicU64,
    pub sync_enqueued: AtomicU64,
    pub sync_dropped: AtomicU64,
    pub sync_completed: AtomicU64,
    pub sync_failed: AtomicU64,
    pub sync_matched: AtomicU64,
    pub sync_mismatched: AtomicU64,
    pub origin_fallbacks: AtomicU64,
    pub mitigations_sent: AtomicU64,
    pub mitigations_received: AtomicU64,
    pub breaker_opened: AtomicU64,
    pub breaker_half_opened: AtomicU64,
    pub breaker_closed: AtomicU64,
    pub ring_size: AtomicUsize,
    pub active_identifiers: AtomicUsize,
    pub queue_backlog: AtomicI64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub decisions_passed: u64,
    pub decisions_rejected: u64,
    pub sync_enqueued: u64,
    pub sync_dropped: u64,
    pub sync_completed: u64,
    pub sync_failed: u64,
    pub sync_matched: u64,
    pub sync_mismatched: u64,
    pub origin_fallbacks: u64,
    pub mitigations_sent: u64,
    pub mitigations_received: u64,
    pub breaker_opened: u64,
    pub breaker_half_opened: u64,
    pub breaker_closed: u64,
    pub ring_size: usize,
    pub active_identifiers: usize,
    pub queue_backlog: i64,
}

impl AtomicMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            decisions_passed: self.decisions_passed.load(Ordering::Relaxed),
            decisions_rejected: self.decisions_rejected.load(Ordering::Relaxed),
            sync_enqueued: self.sync_enqueued.load(Ordering::Relaxed),
            sync_dropped: self.sync_dropped.load(Ordering::Relaxed),
            sync_completed: self.sync_completed.load(Ordering::Relaxed),
            sync_failed: self.sync_failed.load(Ordering::Relaxed),
            sync_matched: self.sync_matched.load(Ordering::Relaxed),
            sync_mismatched: self.sync_mismatched.load(Ordering::Relaxed),
            origin_fallbacks: self.origin_fallbacks.load(Ordering::Relaxed),
            mitigations_sent: self.mitigations_sent.load(Ordering::Relaxed),
            mitigations_received: self.mitigations_received.load(Ordering::Relaxed),
            breaker_opened: self.breaker_opened.load(Ordering::Relaxed),
            breaker_half_opened: self.breaker_half_opened.load(Ordering::Relaxed),
            breaker_closed: self.breaker_closed.load(Ordering::Relaxed),
            ring_size: self.ring_size.load(Ordering::Relaxed),
            active_identifiers: self.active_identifiers.load(Ordering::Relaxed),
            queue_backlog: self.queue_backlog.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for AtomicMetrics {
    fn decision(&self, pass: bool) {
        if pass {
            self.decisions_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.decisions_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sync_enqueued(&self) {
        self.sync_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_dropped(&self) {
        self.sync_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_completed(&self) {
        self.sync_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_failed(&self) {
        self.sync_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_accuracy(&self, matched: bool) {
        if matched {
            self.sync_matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sync_mismatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn origin_fallback(&self) {
        self.origin_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn mitigation_sent(&self) {
        self.mitigations_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn mitigation_received(&self) {
        self.mitigations_received.fetch_add(1, Ordering::Relaxed);
    }

    fn breaker_transition(&self, _name: &str, _from: BreakerState, to: BreakerState) {
        let counter = match to {
            BreakerState::Open => &self.breaker_opened,
            BreakerState::HalfOpen => &self.breaker_half_opened,
            BreakerState::Closed => &self.breaker_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn ring_size(&self, nodes: usize) {
        self.ring_size.store(nodes, Ordering::Relaxed);
    }

    fn active_identifiers(&self, buckets: usize) {
        self.active_identifiers.store(buckets, Ordering::Relaxed);
    }

    fn queue_backlog(&self, delta: i64) {
        self.queue_backlog.fetch_add(delta, Ordering::Relaxed);
    }
}
