pub mod client;
pub mod framing;
pub mod loopback;
pub mod messages;
pub mod server;

pub use client::{PeerClient, TcpPeerClient};
pub use loopback::LoopbackPeers;
pub use messages::{MitigateRequest, PeerRequest, PeerResponse, PushPullRequest, PushPullResponse};
pub use server::{PeerHandler, PeerServer};
