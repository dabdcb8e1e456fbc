//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
    pub const METRICS: &str = "/metrics";
}

pub const EXPIRE_KEYS: &str = "/expire-keys";

pub mod rate_limits {
    pub const LIMIT: &str = "/v1/ratelimit";
    pub const MULTI_LIMIT: &str = "/v1/ratelimit/multi";
}

pub mod cluster {
    pub const MEMBERS: &str = "/cluster/members";
    pub const MEMBER: &str = "/cluster/members/{node_id}";
}

pub fn member_path(node_id: &str) -> String {
    cluster::MEMBER.replace("{node_id}", node_id)
}
