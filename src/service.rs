//! Rate-limit service facade.
//!
//! Every node answers `ratelimit` for every identifier. The hash ring names
//! one origin per bucket key; the origin decides on its own state, other
//! nodes either ask the origin first (when they have never seen the key) or
//! decide locally and let the sync engine tell the origin afterwards.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::BreakerSet;
use crate::consistency::ConsistencyChecker;
use crate::error::{RatemeshError, Result};
use crate::hashring::{HashRing, Node, NodeName};
use crate::invalid_request;
use crate::limiters::request::validate_time;
use crate::limiters::{
    RateLimiter, RatelimitRequest, RatelimitResponse, SetCounterRequest, TakeOutcome,
};
use crate::metrics::Metrics;
use crate::rpc::{MitigateRequest, PeerClient, PeerHandler, PushPullRequest, PushPullResponse};
use crate::settings::Settings;
use crate::sync::{PeerCaller, SyncContext, SyncEngine, SyncEvent};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct RatelimitService {
    node_id: NodeName,
    settings: Settings,
    limiter: Arc<RateLimiter>,
    ring: Arc<HashRing>,
    peers: Arc<PeerCaller>,
    sync: SyncEngine,
    metrics: Arc<dyn Metrics>,
    consistency: Arc<ConsistencyChecker>,
}

impl std::fmt::Debug for RatelimitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatelimitService")
            .field("node_id", &self.node_id)
            .field("buckets", &self.limiter.len())
            .field("ring", &self.ring.len())
            .finish()
    }
}

impl RatelimitService {
    pub fn new(
        settings: &Settings,
        ring: Arc<HashRing>,
        client: Arc<dyn PeerClient>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let node_id = settings.node_name.clone();
        let limiter = Arc::new(RateLimiter::new(settings.counting_policy));
        let consistency = Arc::new(ConsistencyChecker::new());
        let peers = Arc::new(PeerCaller::new(
            client,
            BreakerSet::new(
                settings.breaker.config("sync"),
                settings.breaker.scope,
                metrics.clone(),
            ),
            BreakerSet::new(
                settings.breaker.config("mitigate"),
                settings.breaker.scope,
                metrics.clone(),
            ),
            settings.sync.rpc_timeout,
        ));
        let sync = SyncEngine::new(
            settings.sync.clone(),
            SyncContext {
                node_id: node_id.clone(),
                limiter: limiter.clone(),
                ring: ring.clone(),
                peers: peers.clone(),
                metrics: metrics.clone(),
                consistency: consistency.clone(),
            },
        );
        Self {
            node_id,
            settings: settings.clone(),
            limiter,
            ring,
            peers,
            sync,
            metrics,
            consistency,
        }
    }

    pub fn node_id(&self) -> &NodeName {
        &self.node_id
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn consistency(&self) -> &Arc<ConsistencyChecker> {
        &self.consistency
    }

    pub fn peers(&self) -> &Arc<PeerCaller> {
        &self.peers
    }

    pub async fn ratelimit(&self, request: RatelimitRequest) -> Result<RatelimitResponse> {
        self.ratelimit_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Decide on a request. `cancel` abandons a pending origin call, after
    /// which the decision is made locally.
    pub async fn ratelimit_with_cancel(
        &self,
        request: RatelimitRequest,
        cancel: &CancellationToken,
    ) -> Result<RatelimitResponse> {
        request.validate()?;
        let time = request.time.unwrap_or_else(now_ms);
        let route = request.bucket_key().to_string();

        let response = match self.ring.find_node(&route) {
            Err(e) => {
                warn!(
                    "[Node<{}>] no origin for {} ({}), deciding locally",
                    self.node_id, route, e
                );
                self.metrics.origin_fallback();
                self.limiter.take(&request, time)?.response
            }
            Ok(origin) => {
                self.consistency.record(&route, &origin.id);
                if origin.id == self.node_id {
                    self.take_as_origin(&request, time).await?.response
                } else if self.limiter.check_windows(&request, time) == (false, false) {
                    self.cold_start(&origin, request, time, cancel).await?
                } else {
                    let outcome = self.limiter.take(&request, time)?;
                    let response = outcome.response;
                    self.sync
                        .enqueue(SyncEvent::PushPull {
                            request,
                            time,
                            local_pass: response.pass,
                        })
                        .await;
                    response
                }
            }
        };

        self.metrics.decision(response.pass);
        Ok(response)
    }

    /// Batched `ratelimit`; elements are decided independently, in order
    pub async fn multi_ratelimit(
        &self,
        requests: Vec<RatelimitRequest>,
    ) -> Result<Vec<RatelimitResponse>> {
        for request in &requests {
            request.validate()?;
        }
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.ratelimit(request).await?);
        }
        Ok(responses)
    }

    /// Take on this node and, if that saturated the window and this node is
    /// the origin, queue the mitigation broadcast.
    async fn take_as_origin(&self, request: &RatelimitRequest, time: i64) -> Result<TakeOutcome> {
        let outcome = self.limiter.take(request, time)?;
        if outcome.saturated {
            let key = request.bucket_key();
            match self.ring.find_node(&key.to_string()) {
                Ok(origin) if origin.id == self.node_id => {
                    self.sync
                        .enqueue(SyncEvent::Mitigate {
                            key,
                            window: outcome.current.clone(),
                            previous: outcome.previous.clone(),
                        })
                        .await;
                }
                _ => debug!(
                    "[Node<{}>] {} saturated here but this node is not its origin",
                    self.node_id, key
                ),
            }
        }
        Ok(outcome)
    }

    /// First sight of a key on a non-origin node: ask the origin before answering.
    async fn cold_start(
        &self,
        origin: &Node,
        request: RatelimitRequest,
        time: i64,
        cancel: &CancellationToken,
    ) -> Result<RatelimitResponse> {
        let key = request.bucket_key();
        let call = self.peers.push_pull(
            origin,
            PushPullRequest {
                request: request.clone(),
                time,
            },
        );
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RatemeshError::Cancelled),
            result = call => result,
        };

        match result {
            Ok(reply) => {
                self.limiter.set_counters(&[
                    SetCounterRequest::from_window(&key, &reply.current),
                    SetCounterRequest::from_window(&key, &reply.previous),
                ]);
                Ok(reply.response)
            }
            Err(e) => {
                warn!(
                    "[Node<{}>] origin {} unavailable for {}, deciding locally: {}",
                    self.node_id, origin.id, key, e
                );
                self.metrics.origin_fallback();
                let outcome = self.limiter.take(&request, time)?;
                let response = outcome.response;
                self.sync
                    .enqueue(SyncEvent::PushPull {
                        request,
                        time,
                        local_pass: response.pass,
                    })
                    .await;
                Ok(response)
            }
        }
    }

    /// Sweep expired windows and empty buckets
    pub fn expire_keys(&self) -> usize {
        let removed = self.limiter.expire_windows(now_ms());
        self.metrics.active_identifiers(self.limiter.len());
        removed
    }

    /// Sync workers, window sweep and consistency audit
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.sync.spawn_workers(cancel.clone());

        let service = self.clone();
        let sweep_cancel = cancel.clone();
        let expire_interval = self.settings.expire_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(expire_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = service.expire_keys();
                        debug!("[Node<{}>] expired {} buckets", service.node_id, removed);
                    }
                }
            }
        }));

        handles.push(
            self.consistency
                .clone()
                .spawn(self.settings.consistency_interval, cancel),
        );
        info!("[Node<{}>] background tasks started", self.node_id);
        handles
    }
}

#[async_trait]
impl PeerHandler for RatelimitService {
    /// Called on the origin by a node that decided, or is about to decide, a request
    async fn push_pull(&self, request: PushPullRequest) -> Result<PushPullResponse> {
        request.request.validate()?;
        validate_time(request.time)?;
        let outcome = self.take_as_origin(&request.request, request.time).await?;
        Ok(PushPullResponse {
            response: outcome.response,
            current: outcome.current,
            previous: outcome.previous,
        })
    }

    async fn mitigate(&self, request: MitigateRequest) -> Result<()> {
        if request.key.limit <= 0 || request.key.duration_ms <= 0 {
            return Err(invalid_request!("malformed bucket key {}", request.key));
        }
        debug!(
            "[Node<{}>] mitigating {} window {} at {}",
            self.node_id, request.key, request.window.sequence, request.window.counter
        );
        self.limiter.set_counters(&[SetCounterRequest::from_window(
            &request.key,
            &request.previous,
        )]);
        self.limiter.set_window(&request.key, request.window);
        self.metrics.mitigation_received();
        Ok(())
    }
}
