//! Rolling, hour-aligned send budget per sender identity.
//!
//! The KV counter is authoritative within the hour; the store carries a
//! redundant mirror used only to reseed KV after eviction. `check` followed
//! by `increment` is deliberately not atomic: two workers may both pass the
//! check and overshoot the limit by at most (concurrency - 1), which the
//! budget's advisory contract accepts.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::clock::Clock;
use crate::kv::{Kv, KvError};
use crate::store::Store;

/// Bucket lifetime: the hour plus a minute of overlap so a bucket outlives
/// its own boundary reads.
const BUCKET_TTL: Duration = Duration::from_secs(3660);

const KEY_PREFIX: &str = "rate-limit";

/// What a budget check observed.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: u64,
    /// Where a denied job should be deferred to.
    pub next_bucket_start: OffsetDateTime,
}

pub struct RateLimiter {
    kv: Arc<dyn Kv>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn Kv>, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, store, clock }
    }

    /// Read the current hour's counter for `sender` and compare it to `limit`.
    ///
    /// A counter missing from KV is reseeded from the store mirror; a mirror
    /// read failure counts as zero (KV is authoritative, the mirror is best
    /// effort).
    pub async fn check(&self, sender: &str, limit: u32) -> Result<RateDecision, KvError> {
        let now = self.clock.now();
        let bucket = hour_bucket(now);
        let key = counter_key(&bucket, sender);

        let current = match self.kv.get(&key).await? {
            Some(count) => count,
            None => self.reseed(&bucket, sender, &key).await,
        };

        Ok(RateDecision {
            allowed: current < u64::from(limit),
            current,
            next_bucket_start: next_bucket_start(now),
        })
    }

    /// Count one send against `sender`'s current hour.
    ///
    /// The store mirror is updated out of band; its failure is logged and
    /// does not fail the increment.
    pub async fn increment(&self, sender: &str) -> Result<u64, KvError> {
        let now = self.clock.now();
        let bucket = hour_bucket(now);
        let key = counter_key(&bucket, sender);

        let count = self.kv.incr(&key, BUCKET_TTL).await?;

        let store = self.store.clone();
        let sender = sender.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.upsert_rate_counter(&bucket, &sender, count).await {
                tracing::warn!(%bucket, %sender, error = %e, "rate counter mirror write failed");
            }
        });

        Ok(count)
    }

    async fn reseed(&self, bucket: &str, sender: &str, key: &str) -> u64 {
        match self.store.read_rate_counter(bucket, sender).await {
            Ok(Some(count)) if count > 0 => {
                if let Err(e) = self.kv.set(key, count, BUCKET_TTL).await {
                    tracing::warn!(%bucket, %sender, error = %e, "rate counter reseed failed");
                }
                count
            }
            Ok(_) => 0,
            Err(e) => {
                tracing::warn!(%bucket, %sender, error = %e, "rate counter mirror read failed");
                0
            }
        }
    }
}

fn counter_key(bucket: &str, sender: &str) -> String {
    format!("{KEY_PREFIX}:{bucket}:{sender}")
}

/// UTC instant truncated to the hour, as a key segment: `2026-08-02T14`.
pub fn hour_bucket(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}",
        t.year(),
        t.month() as u8,
        t.day(),
        t.hour()
    )
}

/// Start of the hour containing `t`.
pub fn bucket_start(t: OffsetDateTime) -> OffsetDateTime {
    let secs = t.unix_timestamp();
    let floored = secs - secs.rem_euclid(3600);
    OffsetDateTime::from_unix_timestamp(floored).unwrap_or(t)
}

/// Start of the hour after the one containing `t`.
pub fn next_bucket_start(t: OffsetDateTime) -> OffsetDateTime {
    bucket_start(t) + Duration::from_secs(3600)
}
