//! Circuit breaker guarding outbound peer calls.
//!
//! `Closed` lets every call through and counts downstream failures within a
//! rolling `cyclic_period`. Reaching `trip_threshold` failures opens the
//! breaker: calls fail fast with `Tripped` until `timeout` has passed. The
//! first call after that moves it to `HalfOpen`, where up to `max_requests`
//! probes are admitted. `max_requests` consecutive successes close it again,
//! any downstream failure reopens it.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RatemeshError, Result};
use crate::hashring::NodeName;
use crate::metrics::Metrics;
use crate::settings::BreakerScope;

type FailurePredicate = Arc<dyn Fn(&RatemeshError) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Why a breaker refused to run a call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakerError {
    Tripped { name: String },
    TooManyRequests { name: String },
}

impl fmt::Display for BreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Tripped { name } => write!(f, "breaker '{}' is open", name),
            BreakerError::TooManyRequests { name } => {
                write!(f, "breaker '{}' is half-open and out of probes", name)
            }
        }
    }
}

impl std::error::Error for BreakerError {}

#[derive(Clone)]
pub struct BreakerConfig {
    pub name: String,
    pub trip_threshold: u64,
    pub cyclic_period: Duration,
    pub timeout: Duration,
    pub max_requests: u64,
    is_downstream: FailurePredicate,
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("name", &self.name)
            .field("trip_threshold", &self.trip_threshold)
            .field("cyclic_period", &self.cyclic_period)
            .field("timeout", &self.timeout)
            .field("max_requests", &self.max_requests)
            .finish()
    }
}

impl BreakerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trip_threshold: 5,
            cyclic_period: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 3,
            is_downstream: Arc::new(RatemeshError::is_downstream),
        }
    }

    pub fn with_trip_threshold(mut self, trip_threshold: u64) -> Self {
        self.trip_threshold = trip_threshold.max(1);
        self
    }

    pub fn with_cyclic_period(mut self, cyclic_period: Duration) -> Self {
        self.cyclic_period = cyclic_period;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    /// Replace the predicate deciding which errors count as failures
    pub fn with_downstream_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RatemeshError) -> bool + Send + Sync + 'static,
    {
        self.is_downstream = Arc::new(predicate);
        self
    }

    fn renamed(&self, name: String) -> Self {
        let mut config = self.clone();
        config.name = name;
        config
    }
}

/// Counters for the current period (Closed) or probe round (HalfOpen)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_successes: u64,
    pub consecutive_failures: u64,
}

impl Counts {
    fn on_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    counts: Counts,
    reset_counters_at: Instant,
    reset_state_at: Instant,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Option<Arc<dyn Metrics>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                counts: Counts::default(),
                reset_counters_at: now + config.cyclic_period,
                reset_state_at: now,
            }),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.tick(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// Run `f` if the breaker allows it and record the outcome.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.preflight()?;
        let mut guard = InFlight {
            breaker: self,
            finished: false,
        };
        let result = f().await;
        guard.finished = true;
        self.postflight(result.as_ref().err());
        result
    }

    fn preflight(&self) -> std::result::Result<(), BreakerError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.tick(&mut inner, now);
        match inner.state {
            BreakerState::Open => Err(BreakerError::Tripped {
                name: self.config.name.clone(),
            }),
            BreakerState::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                Err(BreakerError::TooManyRequests {
                    name: self.config.name.clone(),
                })
            }
            _ => {
                inner.counts.requests += 1;
                Ok(())
            }
        }
    }

    fn postflight(&self, error: Option<&RatemeshError>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.tick(&mut inner, now);
        let failed = error.map(|e| (self.config.is_downstream)(e)).unwrap_or(false);

        match (inner.state, failed) {
            (BreakerState::Closed, false) => inner.counts.on_success(),
            (BreakerState::Closed, true) => {
                inner.counts.on_failure();
                if inner.counts.failures >= self.config.trip_threshold {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            (BreakerState::HalfOpen, false) => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_requests {
                    self.transition(&mut inner, BreakerState::Closed, now);
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.counts.on_failure();
                self.transition(&mut inner, BreakerState::Open, now);
            }
            // a call admitted before the trip finished late
            (BreakerState::Open, _) => {}
        }
        if let Some(err) = error {
            if failed {
                debug!(
                    "breaker '{}' counted failure ({}): {}",
                    self.config.name, inner.counts.failures, err
                );
            }
        }
    }

    /// A call that was dropped before finishing gives its probe slot back
    fn abandon(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    /// Time-driven changes: counter period roll-over and Open -> HalfOpen
    fn tick(&self, inner: &mut BreakerInner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if now >= inner.reset_counters_at {
                    inner.counts = Counts::default();
                    inner.reset_counters_at = now + self.config.cyclic_period;
                }
            }
            BreakerState::Open => {
                if now >= inner.reset_state_at {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.counts = Counts::default();
        match to {
            BreakerState::Closed => inner.reset_counters_at = now + self.config.cyclic_period,
            BreakerState::Open => inner.reset_state_at = now + self.config.timeout,
            BreakerState::HalfOpen => {}
        }
        if to == BreakerState::Open {
            warn!("breaker '{}' {} -> {}", self.config.name, from, to);
        } else {
            debug!("breaker '{}' {} -> {}", self.config.name, from, to);
        }
        if let Some(metrics) = &self.metrics {
            metrics.breaker_transition(&self.config.name, from, to);
        }
    }
}

struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.abandon();
        }
    }
}

/// Breakers for one logical call-site, either shared by all peers or one per peer.
pub struct BreakerSet {
    config: BreakerConfig,
    scope: BreakerScope,
    shared: Arc<CircuitBreaker>,
    per_peer: RwLock<HashMap<NodeName, Arc<CircuitBreaker>>>,
    metrics: Arc<dyn Metrics>,
}

impl fmt::Debug for BreakerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSet")
            .field("name", &self.config.name)
            .field("scope", &self.scope)
            .finish()
    }
}

impl BreakerSet {
    pub fn new(config: BreakerConfig, scope: BreakerScope, metrics: Arc<dyn Metrics>) -> Self {
        let shared = Arc::new(CircuitBreaker::new(config.clone()).with_metrics(metrics.clone()));
        Self {
            config,
            scope,
            shared,
            per_peer: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn scope(&self) -> BreakerScope {
        self.scope
    }

    pub fn breaker(&self, peer: &NodeName) -> Arc<CircuitBreaker> {
        match self.scope {
            BreakerScope::Shared => self.shared.clone(),
            BreakerScope::PerPeer => {
                if let Some(breaker) = self.per_peer.read().get(peer) {
                    return breaker.clone();
                }
                self.per_peer
                    .write()
                    .entry(peer.clone())
                    .or_insert_with(|| {
                        let config = self.config.renamed(format!("{}/{}", self.config.name, peer));
                        Arc::new(CircuitBreaker::new(config).with_metrics(self.metrics.clone()))
                    })
                    .clone()
            }
        }
    }
}
