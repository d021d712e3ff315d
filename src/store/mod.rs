pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::DecisionError;
use async_trait::async_trait;
use std::time::Duration;

/// A named atomic script plus the Lua source that implements it, so both
/// `RedisStore` and `MemoryStore` key their dispatch off the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptId {
    TokenBucket,
    SlidingWindowLog,
    SlidingWindowCounter,
    FixedWindow,
    LeakyBucket,
}

/// Contract every strategy drives its storage through. Implementations must
/// execute `exec_script` atomically with respect to every other call for the
/// same keys — this is the sole synchronization primitive in the system; no
/// distributed locks are layered on top of it.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Evaluate the named script with the given keys/args, returning its raw
    /// reply values in order.
    async fn exec_script(
        &self,
        script: ScriptId,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<redis::Value>, DecisionError>;

    /// List keys under `prefix` (used by config pattern scans and admin
    /// listing). Not required to be atomic with concurrent writes.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, DecisionError>;

    /// Fetch a config hash written by the resolver, or `None` if absent.
    async fn get_hash(&self, key: &str) -> Result<Option<Vec<(String, String)>>, DecisionError>;

    /// Write a config hash with the given field/value pairs and TTL.
    async fn set_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), DecisionError>;

    async fn delete(&self, keys: &[String]) -> Result<(), DecisionError>;

    /// Round-trip liveness check; returns the observed latency.
    async fn ping(&self) -> Result<Duration, DecisionError>;
}
