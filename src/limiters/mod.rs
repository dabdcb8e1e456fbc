pub mod request;
pub mod sliding_window;
pub mod window;

pub use request::{RatelimitRequest, RatelimitResponse};
pub use sliding_window::{RateLimiter, SetCounterRequest, TakeOutcome};
pub use window::{Bucket, BucketKey, Window};
