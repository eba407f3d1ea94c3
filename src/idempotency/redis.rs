//! Redis idempotency store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{IdempotencyStore, Result};

/// Markers are `SET NX EX` keys that expire after the TTL.
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    pub async fn connect(url: &str, key_prefix: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            ttl,
        })
    }

    fn key(&self, event_id: &str) -> String {
        format!("{}:idempotent:{}", self.key_prefix, event_id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn check(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(event_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        // Nil reply: the key already existed
        Ok(set.is_none())
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(event_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
