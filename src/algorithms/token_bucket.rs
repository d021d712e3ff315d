use super::{expect_i64, AlgorithmTag, Decision, RateLimitAlgorithm};
use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use crate::store::{RateLimitStore, ScriptId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Smoothly refilling bucket: bursts up to `capacity`, long-run rate
/// `refill_rate / refill_period_seconds` tokens per second.
pub struct TokenBucket;

impl TokenBucket {
    pub fn new() -> Self {
        Self
    }

    fn key(key: &str) -> String {
        format!("ratelimit:bucket:{key}")
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucket {
    fn tag(&self) -> AlgorithmTag {
        AlgorithmTag::TokenBucket
    }

    async fn decide(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        tokens: u64,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionError> {
        let rate_per_sec = config.refill_rate / config.refill_period_seconds as f64;
        let keys = vec![Self::key(key)];
        let args = vec![
            config.capacity.to_string(),
            rate_per_sec.to_string(),
            now.timestamp_millis().to_string(),
            tokens.to_string(),
        ];

        let reply = store.exec_script(ScriptId::TokenBucket, &keys, &args).await?;
        let allowed = expect_i64(&reply, 0, "allowed")? == 1;
        let remaining = expect_i64(&reply, 1, "remaining")?;
        let retry_after_ms = expect_i64(&reply, 2, "retry_after_ms")?;

        Ok(Decision {
            allowed,
            remaining,
            reset_at: now + ChronoDuration::seconds(config.refill_period_seconds as i64),
            retry_after_secs: if allowed {
                None
            } else {
                Some(retry_after_ms as f64 / 1000.0)
            },
            algorithm: AlgorithmTag::TokenBucket,
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
            algorithm: AlgorithmTag::TokenBucket,
            capacity: 10,
            refill_rate: 10.0,
            refill_period_seconds: 60,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn burst_then_deny_with_six_second_retry() {
        let store = MemoryStore::new();
        let strategy = TokenBucket::new();
        let cfg = config();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for i in 0..10 {
            let d = strategy.decide(&store, "k", 1, &cfg, now).await.unwrap();
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 9 - i);
        }

        let denied = strategy.decide(&store, "k", 1, &cfg, now).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(6.0));
    }
}
