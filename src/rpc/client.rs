//! Outbound peer calls
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::framing::{read_frame, write_frame};
use super::messages::{
    MitigateRequest, PeerRequest, PeerResponse, PushPullRequest, PushPullResponse,
};
use crate::error::{RatemeshError, Result};
use crate::hashring::Node;
use crate::transport_error;

/// How this node talks to its peers. Deadlines are applied by the caller.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn push_pull(&self, peer: &Node, request: PushPullRequest) -> Result<PushPullResponse>;

    async fn mitigate(&self, peer: &Node, request: MitigateRequest) -> Result<()>;
}

/// Connects to `Node::rpc_address` for each call
#[derive(Clone, Debug, Default)]
pub struct TcpPeerClient;

impl TcpPeerClient {
    pub fn new() -> Self {
        Self
    }

    async fn send(&self, peer: &Node, request: &PeerRequest) -> Result<PeerResponse> {
        let data = request.serialize()?;
        let mut stream = TcpStream::connect(&peer.rpc_address)
            .await
            .map_err(|e| transport_error!("Failed to connect to {}: {}", peer.id, e))?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &data).await?;
        let response = read_frame(&mut stream)
            .await?
            .ok_or_else(|| transport_error!("{} closed the connection", peer.id))?;
        debug!("received {} bytes from {}", response.len(), peer.id);
        Ok(PeerResponse::deserialize(&response)?)
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn push_pull(&self, peer: &Node, request: PushPullRequest) -> Result<PushPullResponse> {
        match self.send(peer, &PeerRequest::PushPull(request)).await? {
            PeerResponse::PushPull(response) => Ok(response),
            PeerResponse::Error { message } => Err(RatemeshError::Remote(message)),
            other => Err(RatemeshError::Remote(format!(
                "unexpected push-pull reply from {}: {:?}",
                peer.id, other
            ))),
        }
    }

    async fn mitigate(&self, peer: &Node, request: MitigateRequest) -> Result<()> {
        match self.send(peer, &PeerRequest::Mitigate(request)).await? {
            PeerResponse::Ack => Ok(()),
            PeerResponse::Error { message } => Err(RatemeshError::Remote(message)),
            other => Err(RatemeshError::Remote(format!(
                "unexpected mitigate reply from {}: {:?}",
                peer.id, other
            ))),
        }
    }
}
