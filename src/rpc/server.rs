//! Peer RPC server
//!
//! Accepts TCP connections from peers and answers framed `PeerRequest`s
//! until the peer hangs up. Each connection is served by its own task.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::framing::{read_frame, write_frame};
use super::messages::{
    MitigateRequest, PeerRequest, PeerResponse, PushPullRequest, PushPullResponse,
};
use crate::error::Result;
use crate::transport_error;

/// Answers peer requests; implemented by the rate-limit service
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn push_pull(&self, request: PushPullRequest) -> Result<PushPullResponse>;

    async fn mitigate(&self, request: MitigateRequest) -> Result<()>;
}

/// Route a decoded request to the handler, folding errors into the reply
pub async fn dispatch(handler: &dyn PeerHandler, request: PeerRequest) -> PeerResponse {
    let result = match request {
        PeerRequest::PushPull(req) => handler.push_pull(req).await.map(PeerResponse::PushPull),
        PeerRequest::Mitigate(req) => handler.mitigate(req).await.map(|_| PeerResponse::Ack),
    };
    result.unwrap_or_else(|e| PeerResponse::Error {
        message: e.to_string(),
    })
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub messages_received: AtomicU64,
    pub receive_errors: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrozenServerStats {
    pub connections_accepted: u64,
    pub messages_received: u64,
    pub receive_errors: u64,
}

impl ServerStats {
    pub fn freeze(&self) -> FrozenServerStats {
        FrozenServerStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct PeerServer {
    pub local_addr: SocketAddr,
    listener: TcpListener,
    stats: Arc<ServerStats>,
}

impl PeerServer {
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| transport_error!("Socket creation failed: {}", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| transport_error!("Socket creation failed: {}", e))?;
        Ok(Self {
            local_addr,
            listener,
            stats: Arc::new(ServerStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Serve until cancelled
    pub fn spawn(self, handler: Arc<dyn PeerHandler>, cancel: CancellationToken) -> JoinHandle<()> {
        info!("Peer RPC listening on {}", self.local_addr);
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = tokio::select! {
                    _ = cancel.cancelled() => {
                        let stats = self.stats.freeze();
                        info!(
                            "Peer RPC server on {} stopping: {} connections, {} messages, {} errors",
                            self.local_addr,
                            stats.connections_accepted,
                            stats.messages_received,
                            stats.receive_errors
                        );
                        break;
                    }
                    accepted = self.listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("TCP accept failed: {}", e);
                            continue;
                        }
                    },
                };
                self.stats
                    .connections_accepted
                    .fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve_connection(
                    stream,
                    peer_addr,
                    handler.clone(),
                    self.stats.clone(),
                    cancel.clone(),
                ));
            }
        })
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn PeerHandler>,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut stream) => frame,
        };
        let data = match frame {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("{} closed connection", peer_addr);
                return;
            }
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping connection from {}: {}", peer_addr, e);
                return;
            }
        };
        stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let response = match PeerRequest::deserialize(&data) {
            Ok(request) => dispatch(handler.as_ref(), request).await,
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                PeerResponse::Error {
                    message: format!("Undecodable request: {}", e),
                }
            }
        };

        let encoded = match response.serialize() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode reply for {}: {}", peer_addr, e);
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &encoded).await {
            warn!("Failed to reply to {}: {}", peer_addr, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::error::RatemeshError;
    use crate::hashring::{Node, NodeName};
    use crate::limiters::{BucketKey, RatelimitRequest, RatelimitResponse, Window};
    use crate::rpc::client::{PeerClient, TcpPeerClient};

    #[derive(Default)]
    struct RecordingHandler {
        mitigated: Mutex<Vec<MitigateRequest>>,
    }

    #[async_trait]
    impl PeerHandler for RecordingHandler {
        async fn push_pull(&self, request: PushPullRequest) -> Result<PushPullResponse> {
            if request.request.identifier == "broken" {
                return Err(RatemeshError::InvalidRequest("broken".to_string()));
            }
            let duration = request.request.duration;
            let mut current = Window::new(request.time / duration, duration);
            current.counter = 1;
            Ok(PushPullResponse {
                response: RatelimitResponse {
                    pass: true,
                    limit: request.request.limit,
                    remaining: request.request.limit - 1,
                    reset: current.end(),
                    current: 1,
                },
                previous: Window::new(current.sequence - 1, duration),
                current,
            })
        }

        async fn mitigate(&self, request: MitigateRequest) -> Result<()> {
            self.mitigated.lock().push(request);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let server = PeerServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr;
        let stats = server.stats();
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();
        let handle = server.spawn(handler.clone(), cancel.clone());

        let peer = Node::new(NodeName::from("remote"), addr.to_string());
        let client = TcpPeerClient::new();

        let reply = client
            .push_pull(
                &peer,
                PushPullRequest {
                    request: RatelimitRequest::new("k1", 5, 1_000, 1),
                    time: 12_345,
                },
            )
            .await
            .unwrap();
        assert!(reply.response.pass);
        assert_eq!(reply.current.sequence, 12);

        let mut window = Window::new(12, 1_000);
        window.counter = 5;
        client
            .mitigate(
                &peer,
                MitigateRequest {
                    key: BucketKey::new("k1", 5, 1_000),
                    window,
                    previous: Window::new(11, 1_000),
                },
            )
            .await
            .unwrap();
        assert_eq!(handler.mitigated.lock().len(), 1);

        let err = client
            .push_pull(
                &peer,
                PushPullRequest {
                    request: RatelimitRequest::new("broken", 5, 1_000, 1),
                    time: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RatemeshError::Remote(_)));

        assert_eq!(stats.freeze().messages_received, 3);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = Node::new(NodeName::from("gone"), addr.to_string());
        let err = TcpPeerClient::new()
            .mitigate(
                &peer,
                MitigateRequest {
                    key: BucketKey::new("k1", 5, 1_000),
                    window: Window::new(0, 1_000),
                    previous: Window::new(-1, 1_000),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_downstream());
    }
}
