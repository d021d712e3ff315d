use super::{expect_i64, AlgorithmTag, Decision, RateLimitAlgorithm};
use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use crate::store::{RateLimitStore, ScriptId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use uuid::Uuid;

/// Precise sliding window backed by a per-request log of timestamps. Exact
/// but O(capacity) memory per bucket — callers are limited to capacity
/// <= 10_000 by `RateLimitConfig::validate`.
pub struct SlidingWindowLog;

impl SlidingWindowLog {
    pub fn new() -> Self {
        Self
    }

    fn key(key: &str) -> String {
        format!("ratelimit:sliding:{key}")
    }
}

impl Default for SlidingWindowLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLog {
    fn tag(&self) -> AlgorithmTag {
        AlgorithmTag::SlidingWindow
    }

    async fn decide(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        tokens: u64,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionError> {
        let window_ms = config.refill_period_seconds as i64 * 1000;
        let keys = vec![Self::key(key)];
        let args = vec![
            config.capacity.to_string(),
            window_ms.to_string(),
            now.timestamp_millis().to_string(),
            tokens.to_string(),
            Uuid::new_v4().to_string(),
            (config.refill_period_seconds + 60).to_string(),
        ];

        let reply = store
            .exec_script(ScriptId::SlidingWindowLog, &keys, &args)
            .await?;
        let allowed = expect_i64(&reply, 0, "allowed")? == 1;
        let remaining = expect_i64(&reply, 1, "remaining")?;
        let oldest_ms = expect_i64(&reply, 2, "oldest")?;

        let reset_at = if oldest_ms > 0 {
            Utc.timestamp_millis_opt(oldest_ms)
                .single()
                .unwrap_or(now)
                + ChronoDuration::milliseconds(window_ms)
        } else {
            now + ChronoDuration::milliseconds(window_ms)
        };

        Ok(Decision {
            allowed,
            remaining,
            reset_at,
            retry_after_secs: if allowed {
                None
            } else {
                Some((reset_at - now).num_milliseconds().max(0) as f64 / 1000.0)
            },
            algorithm: AlgorithmTag::SlidingWindow,
        })
    }

    async fn reset(&self, store: &dyn RateLimitStore, key: &str) -> Result<(), DecisionError> {
        store.delete(&[Self::key(key)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            algorithm: AlgorithmTag::SlidingWindow,
            capacity: 3,
            refill_rate: 3.0,
            refill_period_seconds: 2,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn three_in_window_then_deny_then_allow_after_expiry() {
        let store = MemoryStore::new();
        let strategy = SlidingWindowLog::new();
        let cfg = config();
        let base = Utc::now();

        for i in 0..3 {
            let d = strategy.decide(&store, "k", 1, &cfg, base).await.unwrap();
            assert!(d.allowed, "request {i} at t=0 should be allowed");
        }

        let at_half = base + ChronoDuration::milliseconds(500);
        let denied = strategy.decide(&store, "k", 1, &cfg, at_half).await.unwrap();
        assert!(!denied.allowed);

        let at_2_1 = base + ChronoDuration::milliseconds(2100);
        let allowed = strategy.decide(&store, "k", 1, &cfg, at_2_1).await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 2);
    }
}
