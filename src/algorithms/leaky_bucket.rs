use super::{expect_i64, AlgorithmTag, Decision, RateLimitAlgorithm};
use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use crate::store::{RateLimitStore, ScriptId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Constant-rate drain: requests join a virtual queue of depth `capacity`
/// that leaks at `refill_rate / refill_period_seconds` items per second.
/// No burst beyond capacity, unlike token bucket.
pub struct LeakyBucket;

impl LeakyBucket {
    pub fn new() -> Self {
        Self
    }

    fn key(key: &str) -> String {
        format!("ratelimit:leaky:{key}")
    }
}

impl Default for LeakyBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitAlgorithm for LeakyBucket {
    fn tag(&self) -> AlgorithmTag {
        AlgorithmTag::LeakyBucket
    }

    async fn decide(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        tokens: u64,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionError> {
        let leak_rate = config.refill_rate / config.refill_period_seconds as f64;
        let keys = vec![Self::key(key)];
        let args = vec![
            config.capacity.to_string(),
            leak_rate.to_string(),
            now.timestamp_millis().to_string(),
            tokens.to_string(),
        ];

        let reply = store.exec_script(ScriptId::LeakyBucket, &keys, &args).await?;
        let allowed = expect_i64(&reply, 0, "allowed")? == 1;
        let queue_x1000 = expect_i64(&reply, 1, "queue_size")?;
        let third = expect_i64(&reply, 2, "wait_or_retry_ms")?;

        let remaining = ((config.capacity as f64) - (queue_x1000 as f64 / 1000.0))
            .max(0.0)
            .floor() as i64;

        Ok(Decision {
            allowed,
            remaining,
            reset_at: now + ChronoDuration::seconds(config.refill_period_seconds as i64),
            retry_after_secs: if allowed {
                None
            } else {
                // clamp: degenerate rate=0 scripts already return 1000ms.
                Some((third.max(1) as f64) / 1000.0)
            },
            algorithm: AlgorithmTag::LeakyBucket,
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
    use chrono::TimeZone;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            algorithm: AlgorithmTag::LeakyBucket,
            capacity: 3,
            refill_rate: 1.0,
            refill_period_seconds: 1,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn fills_then_drains_at_constant_rate() {
        let store = MemoryStore::new();
        let strategy = LeakyBucket::new();
        let cfg = config();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for i in 0..3 {
            let d = strategy.decide(&store, "k", 1, &cfg, t0).await.unwrap();
            assert!(d.allowed, "request {i} at t=0 should be allowed");
        }
        let denied = strategy.decide(&store, "k", 1, &cfg, t0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(1.0));

        let t_after = t0 + ChronoDuration::milliseconds(3_100);
        for i in 0..3 {
            let d = strategy.decide(&store, "k", 1, &cfg, t_after).await.unwrap();
            assert!(d.allowed, "request {i} after drain should be allowed");
        }
        let denied_again = strategy.decide(&store, "k", 1, &cfg, t_after).await.unwrap();
        assert!(!denied_again.allowed);
    }

    #[tokio::test]
    async fn zero_leak_rate_clamps_retry_after_to_one_second() {
        let store = MemoryStore::new();
        let strategy = LeakyBucket::new();
        let cfg = RateLimitConfig {
            refill_rate: 0.0,
            ..config()
        };
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for _ in 0..3 {
            assert!(strategy.decide(&store, "k", 1, &cfg, t0).await.unwrap().allowed);
        }
        let denied = strategy.decide(&store, "k", 1, &cfg, t0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(1.0));
    }
}
