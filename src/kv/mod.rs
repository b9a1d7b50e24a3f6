//! Shared counter store.
//!
//! The rolling-hour rate limiter needs an atomic increment with a TTL that
//! several workers (possibly several processes) can share. [`Kv`] is that
//! contract; [`MemoryKv`] serves development and testing, [`RedisKv`] is the
//! shared deployment backend.

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Volatile key/value store with atomic increment and TTL.
#[async_trait]
pub trait Kv: Send + Sync + 'static {
    /// Atomically increment `key` by one and return the new value.
    ///
    /// On the transition from absent to 1, the key's TTL is set to `ttl`;
    /// later increments leave the expiry untouched.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError>;

    /// Read a counter. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>, KvError>;

    /// Write a counter with a TTL. Used to reseed after eviction.
    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), KvError>;

    /// List keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), KvError>;
}
