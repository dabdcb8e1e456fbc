//! Client-facing rate-limit request and decision types
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use super::window::BucketKey;
use crate::error::Result;
use crate::invalid_request;

fn default_cost() -> i64 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Encode, Decode)]
pub struct RatelimitRequest {
    pub identifier: String,
    pub limit: i64,
    /// Window length in milliseconds
    pub duration: i64,
    #[serde(default = "default_cost")]
    pub cost: i64,
    /// Epoch milliseconds; the receiving node's clock when absent
    #[serde(default)]
    pub time: Option<i64>,
}

impl RatelimitRequest {
    pub fn new(identifier: &str, limit: i64, duration: i64, cost: i64) -> Self {
        Self {
            identifier: identifier.to_string(),
            limit,
            duration,
            cost,
            time: None,
        }
    }

    pub fn at(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(invalid_request!("identifier must not be empty"));
        }
        if self.limit <= 0 {
            return Err(invalid_request!("limit must be positive, got {}", self.limit));
        }
        if self.duration <= 0 {
            return Err(invalid_request!(
                "duration must be positive, got {}",
                self.duration
            ));
        }
        if self.cost < 0 {
            return Err(invalid_request!("cost must not be negative, got {}", self.cost));
        }
        if let Some(time) = self.time {
            validate_time(time)?;
        }
        Ok(())
    }

    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::new(&self.identifier, self.limit, self.duration)
    }
}

/// Decision times are epoch milliseconds and never before the epoch
pub fn validate_time(time: i64) -> Result<()> {
    if time < 0 {
        return Err(invalid_request!("time must not be negative, got {}", time));
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, Encode, Decode)]
pub struct RatelimitResponse {
    pub pass: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Epoch milliseconds when the current window ends
    pub reset: i64,
    /// Estimated requests counted against the limit
    pub current: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(RatelimitRequest::new("k", 10, 1_000, 1).validate().is_ok());
        assert!(RatelimitRequest::new("k", 10, 1_000, 0).validate().is_ok());
        assert!(RatelimitRequest::new("", 10, 1_000, 1).validate().is_err());
        assert!(RatelimitRequest::new("k", 0, 1_000, 1).validate().is_err());
        assert!(RatelimitRequest::new("k", 10, 0, 1).validate().is_err());
        assert!(RatelimitRequest::new("k", 10, 1_000, -1).validate().is_err());
        assert!(RatelimitRequest::new("k", 10, 1_000, 1).at(0).validate().is_ok());
        assert!(RatelimitRequest::new("k", 10, 1_000, 1)
            .at(i64::MIN)
            .validate()
            .is_err());
        assert!(RatelimitRequest::new("k", i64::MAX, i64::MAX, i64::MAX)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_json_defaults() {
        let req: RatelimitRequest =
            serde_json::from_str(r#"{"identifier":"k","limit":5,"duration":1000}"#).unwrap();
        assert_eq!(req.cost, 1);
        assert_eq!(req.time, None);
        assert_eq!(req.bucket_key().to_string(), "k::5::1000");
    }
}
