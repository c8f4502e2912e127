//! Redis-backed counter store.
//!
//! Each operation is one Lua script, so the read-modify-write for a key is
//! atomic on the server no matter how many limiter processes share it.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BucketOutcome, BucketSpec, CounterStore, StoreError, StoreResult};
use crate::ratelimit::{FixedWindow, SlidingOutcome};

// Each script starts by dropping a key left behind by another strategy
// under the same rule name.

const FIXED_WINDOW_LUA: &str = r#"
local kind = redis.call('TYPE', KEYS[1])['ok']
if kind ~= 'none' and kind ~= 'string' then
  redis.call('DEL', KEYS[1])
end
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local member = ARGV[5]

local kind = redis.call('TYPE', key)['ok']
if kind ~= 'none' and kind ~= 'zset' then
  redis.call('DEL', key)
end

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local count = redis.call('ZCARD', key)

if count + cost <= limit then
  for i = 1, cost do
    redis.call('ZADD', key, now_ms, member .. ':' .. i)
  end
  redis.call('PEXPIRE', key, window_ms)
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  return {1, count + cost, -1, tonumber(oldest[2])}
end

local retry_at = now_ms + window_ms
if cost <= limit then
  local idx = count + cost - limit - 1
  local entry = redis.call('ZRANGE', key, idx, idx, 'WITHSCORES')
  if entry[2] then
    retry_at = tonumber(entry[2]) + window_ms
  end
end
local oldest_ms = -1
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {0, count, retry_at, oldest_ms}
"#;

const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local kind = redis.call('TYPE', key)['ok']
if kind ~= 'none' and kind ~= 'hash' then
  redis.call('DEL', key)
end

local state = redis.call('HMGET', key, 'level', 'ts', 'kind')
local level = tonumber(state[1])
local ts = tonumber(state[2])
if level == nil or state[3] ~= 'token' then
  level = capacity
  ts = now_ms
end

level = math.min(capacity, level + (math.max(0, now_ms - ts) / 1000.0) * rate)
ts = math.max(ts, now_ms)

local allowed = 0
if level + 1e-9 >= cost then
  level = math.max(0, level - cost)
  allowed = 1
end

redis.call('HSET', key, 'level', tostring(level), 'ts', ts, 'kind', 'token')
redis.call('PEXPIRE', key, math.max(1, math.ceil((capacity - level) / rate * 1000)))
return {allowed, tostring(level)}
"#;

const LEAKY_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local kind = redis.call('TYPE', key)['ok']
if kind ~= 'none' and kind ~= 'hash' then
  redis.call('DEL', key)
end

local state = redis.call('HMGET', key, 'level', 'ts', 'kind')
local level = tonumber(state[1])
local ts = tonumber(state[2])
if level == nil or state[3] ~= 'leaky' then
  level = 0
  ts = now_ms
end

level = math.max(0, level - (math.max(0, now_ms - ts) / 1000.0) * rate)
ts = math.max(ts, now_ms)

local allowed = 0
if level + cost <= capacity + 1e-9 then
  level = math.min(capacity, level + cost)
  allowed = 1
end

redis.call('HSET', key, 'level', tostring(level), 'ts', ts, 'kind', 'leaky')
redis.call('PEXPIRE', key, math.max(1, math.ceil(level / rate * 1000)))
return {allowed, tostring(level)}
"#;

/// Counter store shared by every limiter process pointed at the same Redis.
///
/// The connection is opened on first use. Until it succeeds every call fails
/// as unavailable, and each later call or [`CounterStore::ping`] tries again.
pub struct RedisStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    key_prefix: String,
    fixed: Script,
    sliding: Script,
    token: Script,
    leaky: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`, giving up after `timeout`.
    pub async fn connect(url: &str, key_prefix: &str, timeout: Duration) -> StoreResult<Self> {
        let store = Self::lazy(url, key_prefix)?;
        tokio::time::timeout(timeout, store.connection())
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(store)
    }

    /// Build a store for `url` without connecting. Only the URL is checked.
    pub fn lazy(url: &str, key_prefix: &str) -> StoreResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
            key_prefix: key_prefix.to_string(),
            fixed: Script::new(FIXED_WINDOW_LUA),
            sliding: Script::new(SLIDING_WINDOW_LUA),
            token: Script::new(TOKEN_BUCKET_LUA),
            leaky: Script::new(LEAKY_BUCKET_LUA),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.manager.initialized()
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = self.client.get_connection_manager().await?;
                info!(key_prefix = %self.key_prefix, "Connected to Redis counter store");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// `{prefix}:{ruleName}:{identifier}`
    pub fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Fixed window counters get one Redis key per window.
    pub fn window_key(&self, key: &str, window: FixedWindow) -> String {
        format!("{}:{}", self.key(key), window.start_ms)
    }
}

fn parse_level(raw: &str) -> StoreResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| StoreError::Protocol(format!("bucket level '{}' is not a number", raw)))
}

fn optional_ms(raw: i64) -> Option<u64> {
    (raw >= 0).then_some(raw as u64)
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn incr_fixed(
        &self,
        key: &str,
        cost: u64,
        window: FixedWindow,
        now_ms: u64,
    ) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let ttl_ms = window.end_ms.saturating_sub(now_ms).max(1);
        let count: u64 = self
            .fixed
            .key(self.window_key(key, window))
            .arg(cost)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn record_sliding(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        cost: u64,
    ) -> StoreResult<SlidingOutcome> {
        let mut conn = self.connection().await?;
        // Members must be unique per event even when timestamps collide.
        let member = format!("{}-{:016x}", now_ms, rand::thread_rng().gen::<u64>());
        let (allowed, count, retry_at, oldest): (i64, i64, i64, i64) = self
            .sliding
            .key(self.key(key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(cost)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(SlidingOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            retry_at_ms: optional_ms(retry_at),
            oldest_ms: optional_ms(oldest),
        })
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<BucketOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, level): (i64, String) = self
            .token
            .key(self.key(key))
            .arg(spec.capacity)
            .arg(spec.rate)
            .arg(now_ms)
            .arg(cost)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            level: parse_level(&level)?,
        })
    }

    async fn fill_leaky(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: u64,
        now_ms: u64,
    ) -> StoreResult<BucketOutcome> {
        let mut conn = self.connection().await?;
        let (allowed, level): (i64, String) = self
            .leaky
            .key(self.key(key))
            .arg(spec.capacity)
            .arg(spec.rate)
            .arg(now_ms)
            .arg(cost)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            level: parse_level(&level)?,
        })
    }

    /// Redis expires keys on its own through `PEXPIRE`.
    async fn purge_expired(&self, _now_ms: u64) -> StoreResult<usize> {
        Ok(0)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "Redis store ping");
        Ok(())
    }
}
