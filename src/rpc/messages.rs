//! Peer-to-peer wire messages, bincode encoded
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::limiters::{BucketKey, RatelimitRequest, RatelimitResponse, Window};

/// A non-origin node's request, evaluated by the origin at `time`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PushPullRequest {
    pub request: RatelimitRequest,
    pub time: i64,
}

/// The origin's decision and its view of both windows afterwards
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PushPullResponse {
    pub response: RatelimitResponse,
    pub current: Window,
    pub previous: Window,
}

/// A saturated window pushed by the origin to every peer, with the
/// previous window whose carried share helped saturate it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct MitigateRequest {
    pub key: BucketKey,
    pub window: Window,
    pub previous: Window,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum PeerRequest {
    PushPull(PushPullRequest),
    Mitigate(MitigateRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum PeerResponse {
    PushPull(PushPullResponse),
    Ack,
    Error { message: String },
}

impl PeerRequest {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let config = bincode::config::standard().with_big_endian();
        bincode::encode_to_vec(self, config)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let config = bincode::config::standard().with_big_endian();
        let (result, _) = bincode::decode_from_slice(data, config)?;
        Ok(result)
    }
}

impl PeerResponse {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let config = bincode::config::standard().with_big_endian();
        bincode::encode_to_vec(self, config)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let config = bincode::config::standard().with_big_endian();
        let (result, _) = bincode::decode_from_slice(data, config)?;
        Ok(result)
    }
}
