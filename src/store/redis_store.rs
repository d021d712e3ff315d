use super::{RateLimitStore, ScriptId};
use crate::error::DecisionError;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, trace};

// KEYS[1] = bucket key, ARGV[1] = capacity, ARGV[2] = rate per second,
// ARGV[3] = now (ms), ARGV[4] = tokens requested.
// Returns {allowed, remaining, retry_after_ms}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill) / 1000
tokens = math.min(capacity, tokens + elapsed * rate)

if tokens >= requested then
  tokens = tokens - requested
  redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now)
  redis.call('EXPIRE', key, 3600)
  return {1, math.floor(tokens), 0}
else
  redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now)
  redis.call('EXPIRE', key, 3600)
  local deficit = requested - tokens
  local retry_after_ms = math.ceil((deficit / rate) * 1000)
  return {0, math.floor(tokens), retry_after_ms}
end
"#;

// KEYS[1] = sorted-set key, ARGV[1] = capacity, ARGV[2] = window ms,
// ARGV[3] = now ms, ARGV[4] = tokens requested, ARGV[5] = id prefix,
// ARGV[6] = ttl seconds.
// Returns {allowed, remaining, oldest_score}.
const SLIDING_WINDOW_LOG_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local id_prefix = ARGV[5]
local ttl = tonumber(ARGV[6])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local n = redis.call('ZCARD', key)

local oldest = 0
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #first > 0 then
  oldest = tonumber(first[2])
end

if n + requested <= capacity then
  for i = 1, requested do
    redis.call('ZADD', key, now, id_prefix .. ':' .. i)
  end
  redis.call('EXPIRE', key, ttl)
  return {1, capacity - n - requested, oldest}
else
  return {0, math.max(0, capacity - n), oldest}
end
"#;

// KEYS[1] = current-window key, KEYS[2] = previous-window key,
// ARGV[1] = capacity, ARGV[2] = window ms, ARGV[3] = now ms,
// ARGV[4] = tokens requested, ARGV[5] = window start ms, ARGV[6] = ttl secs.
// Returns {allowed, weighted_x1000, cur}.
const SLIDING_WINDOW_COUNTER_SCRIPT: &str = r#"
local cur_key = KEYS[1]
local prev_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local window_start = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local cur = tonumber(redis.call('GET', cur_key) or '0')
local prev = tonumber(redis.call('GET', prev_key) or '0')

local elapsed = now - window_start
local prev_weight = (window - elapsed) / window
if prev_weight < 0 then prev_weight = 0 end
if prev_weight > 1 then prev_weight = 1 end

local weighted = prev * prev_weight + cur

if weighted + requested <= capacity then
  local new_cur = redis.call('INCRBY', cur_key, requested)
  if new_cur == requested then
    redis.call('EXPIRE', cur_key, ttl)
  end
  return {1, math.floor((weighted + requested) * 1000), new_cur}
else
  return {0, math.floor(weighted * 1000), cur}
end
"#;

// KEYS[1] = window counter key, ARGV[1] = capacity, ARGV[2] = tokens
// requested, ARGV[3] = window seconds ttl.
// Returns {allowed, remaining, new_count}.
const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local requested = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local new_count = redis.call('INCRBY', key, requested)
if new_count == requested then
  redis.call('EXPIRE', key, ttl)
end

if new_count <= capacity then
  return {1, capacity - new_count, new_count}
else
  return {0, math.max(0, capacity - new_count + requested), new_count}
end
"#;

// KEYS[1] = bucket key, ARGV[1] = capacity, ARGV[2] = leak rate per second,
// ARGV[3] = now ms, ARGV[4] = tokens requested.
// Returns {allowed, queue_size_x1000, wait_ms}.
const LEAKY_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'queue_size', 'last_leak_ms')
local queue_size = tonumber(state[1])
local last_leak = tonumber(state[2])
if queue_size == nil then
  queue_size = 0
  last_leak = now
end

local elapsed = math.max(0, now - last_leak) / 1000
local leaked = elapsed * rate
queue_size = math.max(0, queue_size - leaked)

if queue_size + requested <= capacity then
  queue_size = queue_size + requested
  redis.call('HMSET', key, 'queue_size', queue_size, 'last_leak_ms', now)
  redis.call('EXPIRE', key, 3600)
  local wait_ms = 0
  if rate > 0 then wait_ms = math.ceil((queue_size / rate) * 1000) end
  return {1, math.floor(queue_size * 1000), wait_ms}
else
  redis.call('HMSET', key, 'queue_size', queue_size, 'last_leak_ms', now)
  redis.call('EXPIRE', key, 3600)
  local overflow = queue_size + requested - capacity
  local retry_after_ms = 1000
  if rate > 0 then retry_after_ms = math.ceil((overflow / rate) * 1000) end
  return {0, math.floor(queue_size * 1000), retry_after_ms}
end
"#;

fn script_for(id: ScriptId) -> &'static Script {
    fn cell(id: ScriptId) -> &'static OnceLock<Script> {
        static TOKEN_BUCKET: OnceLock<Script> = OnceLock::new();
        static SLIDING_WINDOW_LOG: OnceLock<Script> = OnceLock::new();
        static SLIDING_WINDOW_COUNTER: OnceLock<Script> = OnceLock::new();
        static FIXED_WINDOW: OnceLock<Script> = OnceLock::new();
        static LEAKY_BUCKET: OnceLock<Script> = OnceLock::new();
        match id {
            ScriptId::TokenBucket => &TOKEN_BUCKET,
            ScriptId::SlidingWindowLog => &SLIDING_WINDOW_LOG,
            ScriptId::SlidingWindowCounter => &SLIDING_WINDOW_COUNTER,
            ScriptId::FixedWindow => &FIXED_WINDOW,
            ScriptId::LeakyBucket => &LEAKY_BUCKET,
        }
    }
    cell(id).get_or_init(|| {
        let src = match id {
            ScriptId::TokenBucket => TOKEN_BUCKET_SCRIPT,
            ScriptId::SlidingWindowLog => SLIDING_WINDOW_LOG_SCRIPT,
            ScriptId::SlidingWindowCounter => SLIDING_WINDOW_COUNTER_SCRIPT,
            ScriptId::FixedWindow => FIXED_WINDOW_SCRIPT,
            ScriptId::LeakyBucket => LEAKY_BUCKET_SCRIPT,
        };
        Script::new(src)
    })
}

/// Pool knobs for the Redis connection. `ConnectionManager` already
/// reconnects transparently; these bound concurrent in-flight script calls.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_active: usize,
    pub max_wait: Duration,
    pub command_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 64,
            max_wait: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// Store adapter backed by a real Redis (or Redis-protocol-compatible)
/// server. Every mutation goes through one of the scripts above so the
/// server's script engine is the only synchronization primitive.
pub struct RedisStore {
    conn: ConnectionManager,
    inflight: Semaphore,
    pool: PoolConfig,
}

impl RedisStore {
    pub async fn connect(url: &str, pool: PoolConfig) -> Result<Self, DecisionError> {
        let client = redis::Client::open(url)
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            conn,
            inflight: Semaphore::new(pool.max_active),
            pool,
        })
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, DecisionError> {
        tokio::time::timeout(self.pool.max_wait, self.inflight.acquire())
            .await
            .map_err(|_| DecisionError::StoreUnavailable("connection pool exhausted".into()))?
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn exec_script(
        &self,
        script: ScriptId,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<redis::Value>, DecisionError> {
        let _permit = self.acquire().await?;
        let mut invocation = script_for(script).prepare_invoke();
        for k in keys {
            invocation.key(k);
        }
        for a in args {
            invocation.arg(a);
        }

        trace!(?script, ?keys, "store: evaluating script");
        let mut conn = self.conn.clone();
        let result = tokio::time::timeout(
            self.pool.command_timeout,
            invocation.invoke_async::<redis::Value>(&mut conn),
        )
        .await
        .map_err(|_| DecisionError::StoreUnavailable("command timed out".into()))?
        .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;

        match result {
            redis::Value::Array(values) | redis::Value::Set(values) => Ok(values),
            other => Err(DecisionError::StoreScript(format!(
                "expected array reply, got {other:?}"
            ))),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, DecisionError> {
        let _permit = self.acquire().await?;
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn
            .scan_match(&pattern)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?
            .collect()
            .await;
        Ok(keys)
    }

    async fn get_hash(&self, key: &str) -> Result<Option<Vec<(String, String)>>, DecisionError> {
        let _permit = self.acquire().await?;
        let mut conn = self.conn.clone();
        let fields: Vec<(String, String)> = conn
            .hgetall(key)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn set_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), DecisionError> {
        let _permit = self.acquire().await?;
        let mut conn = self.conn.clone();
        conn.hset_multiple(key, fields)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;
        conn.expire(key, ttl.as_secs() as i64)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), DecisionError> {
        if keys.is_empty() {
            return Ok(());
        }
        let _permit = self.acquire().await?;
        let mut conn = self.conn.clone();
        conn.del(keys)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))
    }

    async fn ping(&self) -> Result<Duration, DecisionError> {
        let _permit = self.acquire().await?;
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DecisionError::StoreUnavailable(e.to_string()))?;
        let elapsed = start.elapsed();
        debug!(?elapsed, "store: ping ok");
        Ok(elapsed)
    }
}
