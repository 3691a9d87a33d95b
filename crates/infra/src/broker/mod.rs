//! Infrastructure broker implementations.
//!
//! The broker abstraction and the in-memory broker live in `nomflow-events`.
//! This module provides the Redis-backed transport.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
