//! Redis store backend.
//!
//! Connection pooling via deadpool. `compare_and_swap` runs a small Lua
//! script so the read-compare-write happens as one server-side step;
//! everything else maps onto single Redis commands (SET/ZADD/SADD carry
//! the TTL refresh with an EXPIRE on the same key).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use tracing::info;

use crate::error::{Error, Result};
use crate::kv::Kv;

// ARGV[1] = expected current value ('' for absent), ARGV[2] = new value,
// ARGV[3] = TTL seconds (0 = no expiry)
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if (cur == false and ARGV[1] == '') or cur == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  local ttl = tonumber(ARGV[3])
  if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
  end
  return 1
end
return 0
"#;

/// Pooled Redis backend.
pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    /// Connect and verify the server responds.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Store(format!("redis pool: {e}")))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("redis store connected");
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

fn ttl_secs(ttl: Option<Duration>) -> u64 {
    // Redis TTLs are whole seconds; anything below rounds up to 1
    ttl.map(|d| d.as_secs().max(1)).unwrap_or(0)
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        old: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let swapped: i64 = redis::Script::new(CAS_SCRIPT)
            .key(key)
            .arg(old.unwrap_or(b""))
            .arg(new)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn index_put(
        &self,
        key: &str,
        member: &str,
        score: i64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        if let Some(ttl) = ttl {
            conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await?;
        }
        Ok(())
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn index_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let stop = (offset + limit - 1) as isize;
        Ok(conn.zrevrange(key, offset as isize, stop).await?)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(key, member).await?;
        if let Some(ttl) = ttl {
            conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await?;
        }
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.sismember(key, member).await?)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }
}
