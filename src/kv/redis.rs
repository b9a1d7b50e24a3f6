use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{Kv, KvError};

/// Redis-backed [`Kv`] shared across worker processes.
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError> {
        let mut conn = self.conn().await?;
        let value: u64 = conn
            .incr(key, 1)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        if value == 1 {
            conn.expire::<_, ()>(key, ttl.as_secs() as i64)
                .await
                .map_err(|e| KvError::Backend(e.to_string()))?;
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, KvError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        conn.keys(format!("{prefix}*"))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}
