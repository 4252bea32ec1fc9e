//! Redis backends for the renderq engine.
//!
//! This crate provides:
//! - Delay queue on a sorted set with atomic ready-time pops
//! - Distributed leases with owner-compared renewal and release
//! - Sequence-guarded checkpoint hashes
//! - Event transport via Redis Pub/Sub

pub mod checkpoint;
pub mod config;
mod error;
pub mod lease;
pub mod queue;
pub mod transport;

pub use checkpoint::RedisCheckpointStore;
pub use config::RedisConfig;
pub use lease::RedisLeaseStore;
pub use queue::RedisTaskQueue;
pub use transport::RedisEventChannel;
