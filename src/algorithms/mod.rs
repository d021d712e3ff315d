pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod sliding_window_counter;
pub mod token_bucket;

use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use crate::store::RateLimitStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which strategy governs a bucket. Stored alongside a `RateLimitConfig` and
/// used as the key into the strategy registry built at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgorithmTag {
    TokenBucket,
    SlidingWindow,
    SlidingWindowCounter,
    FixedWindow,
    LeakyBucket,
}

impl AlgorithmTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmTag::TokenBucket => "token_bucket",
            AlgorithmTag::SlidingWindow => "sliding_window",
            AlgorithmTag::SlidingWindowCounter => "sliding_window_counter",
            AlgorithmTag::FixedWindow => "fixed_window",
            AlgorithmTag::LeakyBucket => "leaky_bucket",
        }
    }

    pub fn all() -> [AlgorithmTag; 5] {
        [
            AlgorithmTag::TokenBucket,
            AlgorithmTag::SlidingWindow,
            AlgorithmTag::SlidingWindowCounter,
            AlgorithmTag::FixedWindow,
            AlgorithmTag::LeakyBucket,
        ]
    }
}

impl fmt::Display for AlgorithmTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single decision, independent of the strategy that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<f64>,
    pub algorithm: AlgorithmTag,
}

/// Shared contract every rate-limit strategy implements. Each call is backed
/// by exactly one atomic script invocation against the store — see the
/// `*_SCRIPT` constants in each submodule.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    fn tag(&self) -> AlgorithmTag;

    async fn decide(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        tokens: u64,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionError>;

    async fn reset(&self, store: &dyn RateLimitStore, key: &str) -> Result<(), DecisionError>;
}

/// Tag-to-strategy mapping built once at startup. Missing a tag here is a
/// hard startup error (internal invariant) — see `build_registry`.
pub type AlgorithmRegistry = HashMap<AlgorithmTag, Arc<dyn RateLimitAlgorithm>>;

pub fn build_registry() -> AlgorithmRegistry {
    let mut registry: AlgorithmRegistry = HashMap::new();
    registry.insert(
        AlgorithmTag::TokenBucket,
        Arc::new(token_bucket::TokenBucket::new()),
    );
    registry.insert(
        AlgorithmTag::SlidingWindow,
        Arc::new(sliding_window::SlidingWindowLog::new()),
    );
    registry.insert(
        AlgorithmTag::SlidingWindowCounter,
        Arc::new(sliding_window_counter::SlidingWindowCounter::new()),
    );
    registry.insert(
        AlgorithmTag::FixedWindow,
        Arc::new(fixed_window::FixedWindow::new()),
    );
    registry.insert(
        AlgorithmTag::LeakyBucket,
        Arc::new(leaky_bucket::LeakyBucket::new()),
    );

    for tag in AlgorithmTag::all() {
        if !registry.contains_key(&tag) {
            panic!("algorithm registry missing strategy for {tag}");
        }
    }

    registry
}

/// Helper shared by every strategy: turn a raw store reply into a typed
/// i64/f64, mapping shape mismatches to `DecisionError::StoreScript`.
pub(crate) fn expect_i64(values: &[redis::Value], idx: usize, what: &str) -> Result<i64, DecisionError> {
    match values.get(idx) {
        Some(redis::Value::Int(n)) => Ok(*n),
        other => Err(DecisionError::StoreScript(format!(
            "expected integer for {what} at index {idx}, got {other:?}"
        ))),
    }
}

pub(crate) fn expect_f64(values: &[redis::Value], idx: usize, what: &str) -> Result<f64, DecisionError> {
    match values.get(idx) {
        Some(redis::Value::Int(n)) => Ok(*n as f64),
        Some(redis::Value::BulkString(bytes)) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| {
                DecisionError::StoreScript(format!("unparseable float for {what} at index {idx}"))
            }),
        other => Err(DecisionError::StoreScript(format!(
            "expected number for {what} at index {idx}, got {other:?}"
        ))),
    }
}
