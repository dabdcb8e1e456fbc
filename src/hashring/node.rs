use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Unique identifier for cluster nodes
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, PartialEq, PartialOrd, Ord, Eq, Hash, Encode, Decode,
)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default name for a node that was not given one explicitly
    pub fn from_rpc_address(listen_address: &str, port: u16) -> Self {
        Self(format!("node-{}-{}", listen_address.replace(['.', ':'], "_"), port))
    }
}

impl From<&str> for NodeName {
    fn from(id: &str) -> Self {
        NodeName::new(id.to_string())
    }
}

impl From<String> for NodeName {
    fn from(id: String) -> Self {
        NodeName::new(id)
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster member that can own rate-limit keys
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Node {
    pub id: NodeName,
    pub rpc_address: String,
}

impl Node {
    pub fn new(id: NodeName, rpc_address: String) -> Self {
        Self { id, rpc_address }
    }
}

/// Parses `name=host:port`; a bare `host:port` gets a derived name.
impl std::str::FromStr for Node {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty node description".to_string());
        }
        match s.split_once('=') {
            Some((name, addr)) if !name.is_empty() && !addr.is_empty() => {
                Ok(Node::new(NodeName::from(name), addr.to_string()))
            }
            Some(_) => Err(format!("Invalid node description: {}", s)),
            None => {
                let (host, port) = s
                    .rsplit_once(':')
                    .ok_or_else(|| format!("Node address needs a port: {}", s))?;
                let port: u16 = port
                    .parse()
                    .map_err(|e| format!("Invalid port in {}: {}", s, e))?;
                Ok(Node::new(
                    NodeName::from_rpc_address(host, port),
                    s.to_string(),
                ))
            }
        }
    }
}
