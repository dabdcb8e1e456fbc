//! Background synchronisation with origin nodes.
//!
//! Requests decided locally on a non-origin node are queued as push-pull
//! events; saturated windows on the origin are queued as mitigation events.
//! A fixed pool of workers drains one bounded queue, which caps outbound
//! RPC concurrency no matter how fast requests arrive.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::BreakerSet;
use crate::consistency::ConsistencyChecker;
use crate::error::Result;
use crate::hashring::{HashRing, Node, NodeName};
use crate::limiters::{BucketKey, RateLimiter, RatelimitRequest, SetCounterRequest, Window};
use crate::metrics::Metrics;
use crate::rpc::{MitigateRequest, PeerClient, PushPullRequest, PushPullResponse};
use crate::settings::{BackpressurePolicy, SyncSettings};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// Tell the origin about a locally decided request
    PushPull {
        request: RatelimitRequest,
        time: i64,
        local_pass: bool,
    },
    /// Push a saturated window to every peer
    Mitigate {
        key: BucketKey,
        window: Window,
        previous: Window,
    },
}

/// Outbound peer calls, each behind its call-site breaker and a deadline
pub struct PeerCaller {
    client: Arc<dyn PeerClient>,
    sync_breakers: BreakerSet,
    mitigate_breakers: BreakerSet,
    rpc_timeout: Duration,
}

impl PeerCaller {
    pub fn new(
        client: Arc<dyn PeerClient>,
        sync_breakers: BreakerSet,
        mitigate_breakers: BreakerSet,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            client,
            sync_breakers,
            mitigate_breakers,
            rpc_timeout,
        }
    }

    pub fn sync_breakers(&self) -> &BreakerSet {
        &self.sync_breakers
    }

    pub async fn push_pull(&self, origin: &Node, request: PushPullRequest) -> Result<PushPullResponse> {
        let breaker = self.sync_breakers.breaker(&origin.id);
        breaker
            .call(|| async {
                Ok(tokio::time::timeout(self.rpc_timeout, self.client.push_pull(origin, request))
                    .await??)
            })
            .await
    }

    pub async fn mitigate(&self, peer: &Node, request: MitigateRequest) -> Result<()> {
        let breaker = self.mitigate_breakers.breaker(&peer.id);
        breaker
            .call(|| async {
                tokio::time::timeout(self.rpc_timeout, self.client.mitigate(peer, request)).await?
            })
            .await
    }
}

/// Everything a worker needs to process one event
pub struct SyncContext {
    pub node_id: NodeName,
    pub limiter: Arc<RateLimiter>,
    pub ring: Arc<HashRing>,
    pub peers: Arc<PeerCaller>,
    pub metrics: Arc<dyn Metrics>,
    pub consistency: Arc<ConsistencyChecker>,
}

impl SyncContext {
    pub async fn process(&self, event: SyncEvent) {
        match event {
            SyncEvent::PushPull {
                request,
                time,
                local_pass,
            } => self.push_pull(request, time, local_pass).await,
            SyncEvent::Mitigate {
                key,
                window,
                previous,
            } => self.broadcast_mitigation(key, window, previous).await,
        }
    }

    async fn push_pull(&self, request: RatelimitRequest, time: i64, local_pass: bool) {
        let key = request.bucket_key();
        let route = key.to_string();
        let origin = match self.ring.find_node(&route) {
            Ok(origin) => origin,
            Err(e) => {
                debug!("[Node<{}>] no origin for {}: {}", self.node_id, route, e);
                self.metrics.sync_failed();
                return;
            }
        };
        self.consistency.record(&route, &origin.id);
        if origin.id == self.node_id {
            return;
        }

        match self
            .peers
            .push_pull(&origin, PushPullRequest { request, time })
            .await
        {
            Ok(reply) => {
                self.limiter.set_counters(&[
                    SetCounterRequest::from_window(&key, &reply.current),
                    SetCounterRequest::from_window(&key, &reply.previous),
                ]);
                self.metrics.sync_completed();
                self.metrics.sync_accuracy(reply.response.pass == local_pass);
            }
            Err(e) => {
                self.metrics.sync_failed();
                debug!(
                    "[Node<{}>] push-pull of {} to {} failed: {}",
                    self.node_id, route, origin.id, e
                );
            }
        }
    }

    async fn broadcast_mitigation(&self, key: BucketKey, window: Window, previous: Window) {
        let peers: Vec<Node> = self
            .ring
            .members()
            .into_iter()
            .filter(|node| node.id != self.node_id)
            .collect();
        if peers.is_empty() {
            return;
        }
        debug!(
            "[Node<{}>] broadcasting saturated window {} of {} to {} peers",
            self.node_id,
            window.sequence,
            key,
            peers.len()
        );

        let mut sends = JoinSet::new();
        for peer in peers {
            let caller = self.peers.clone();
            let request = MitigateRequest {
                key: key.clone(),
                window: window.clone(),
                previous: previous.clone(),
            };
            sends.spawn(async move {
                let result = caller.mitigate(&peer, request).await;
                (peer, result)
            });
        }
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => self.metrics.mitigation_sent(),
                Ok((peer, Err(e))) => {
                    warn!(
                        "[Node<{}>] mitigation of {} to {} failed: {}",
                        self.node_id, key, peer.id, e
                    );
                }
                Err(e) => warn!("[Node<{}>] mitigation task failed: {}", self.node_id, e),
            }
        }
    }
}

pub struct SyncEngine {
    tx: mpsc::Sender<SyncEvent>,
    rx: Arc<Mutex<mpsc::Receiver<SyncEvent>>>,
    settings: SyncSettings,
    context: Arc<SyncContext>,
}

impl SyncEngine {
    pub fn new(settings: SyncSettings, context: SyncContext) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            settings,
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    /// Queue an event. Returns false if it was dropped.
    pub async fn enqueue(&self, event: SyncEvent) -> bool {
        let metrics = &self.context.metrics;
        let sent = match self.settings.backpressure {
            BackpressurePolicy::DropNewest => match self.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics.sync_dropped();
                    debug!("[Node<{}>] sync queue full, dropping event", self.context.node_id);
                    return false;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            BackpressurePolicy::Block => self.tx.send(event).await.is_ok(),
        };
        if sent {
            metrics.sync_enqueued();
            metrics.queue_backlog(1);
        } else {
            metrics.sync_dropped();
        }
        sent
    }

    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            "[Node<{}>] starting {} sync workers (queue capacity {}, {})",
            self.context.node_id,
            self.settings.workers,
            self.settings.queue_capacity,
            self.settings.backpressure
        );
        (0..self.settings.workers)
            .map(|_| {
                let rx = self.rx.clone();
                let context = self.context.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let event = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => None,
                                event = rx.recv() => event,
                            }
                        };
                        let Some(event) = event else {
                            break;
                        };
                        context.metrics.queue_backlog(-1);
                        context.process(event).await;
                    }
                })
            })
            .collect()
    }
}
