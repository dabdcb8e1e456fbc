pub mod api;
pub mod breaker;
pub mod cli;
pub mod cluster;
pub mod consistency;
pub mod error;
pub mod hashring;
pub mod limiters;
pub mod metrics;
pub mod rpc;
pub mod service;
pub mod settings;
pub mod sync;
