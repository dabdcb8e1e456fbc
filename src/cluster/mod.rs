pub mod membership;

pub use membership::{Membership, StaticMembership};
