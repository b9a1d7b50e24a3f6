use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::clock::Clock;

use super::{Kv, KvError};

/// In-memory [`Kv`] for development and testing.
///
/// Counters are stored in a `HashMap` behind a mutex and expired lazily
/// against the injected clock. Not shared across processes.
#[derive(Clone)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, (u64, OffsetDateTime)>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match entries.get_mut(key) {
            Some((value, expires_at)) if *expires_at > now => {
                *value += 1;
                Ok(*value)
            }
            _ => {
                entries.insert(key.to_string(), (1, now + ttl));
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, KvError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| *value))
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), KvError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(key, (_, expires_at))| key.starts_with(prefix) && *expires_at > now)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn kv() -> (Arc<ManualClock>, MemoryKv) {
        let clock = Arc::new(ManualClock::new(datetime!(2026-03-01 10:15 UTC)));
        let kv = MemoryKv::new(clock.clone());
        (clock, kv)
    }

    #[tokio::test]
    async fn incr_counts_up_from_one() {
        let (_, kv) = kv();
        assert_eq!(kv.incr("k", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(kv.incr("k", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(kv.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn expired_counter_restarts_at_one() {
        let (clock, kv) = kv();
        kv.incr("k", Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.incr("k", Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn later_incr_does_not_extend_ttl() {
        let (clock, kv) = kv();
        kv.incr("k", Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(59));
        kv.incr("k", Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let (_, kv) = kv();
        kv.set("rate:a", 1, Duration::from_secs(60)).await.unwrap();
        kv.set("rate:b", 2, Duration::from_secs(60)).await.unwrap();
        kv.set("other", 3, Duration::from_secs(60)).await.unwrap();

        let mut keys = kv.scan("rate:").await.unwrap();
        keys.sort();
        assert_eq!(keys, ["rate:a", "rate:b"]);
    }
}
