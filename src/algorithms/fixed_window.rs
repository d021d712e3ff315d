use super::{expect_i64, AlgorithmTag, Decision, RateLimitAlgorithm};
use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use crate::store::{RateLimitStore, ScriptId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Cheapest strategy: one counter per wall-clock window. Documented
/// boundary anomaly — up to 2*capacity may be admitted across a window
/// seam (one burst at the end of window k, another at the start of k+1).
pub struct FixedWindow;

impl FixedWindow {
    pub fn new() -> Self {
        Self
    }

    fn key(key: &str, window_start: i64) -> String {
        format!("ratelimit:fixed:{key}:{window_start}")
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindow {
    fn tag(&self) -> AlgorithmTag {
        AlgorithmTag::FixedWindow
    }

    async fn decide(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        tokens: u64,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionError> {
        let window_secs = config.refill_period_seconds as i64;
        let now_secs = now.timestamp();
        let window_start = now_secs - now_secs.rem_euclid(window_secs);

        let keys = vec![Self::key(key, window_start)];
        let args = vec![
            config.capacity.to_string(),
            tokens.to_string(),
            window_secs.to_string(),
        ];

        let reply = store.exec_script(ScriptId::FixedWindow, &keys, &args).await?;
        let allowed = expect_i64(&reply, 0, "allowed")? == 1;
        let remaining = expect_i64(&reply, 1, "remaining")?;
        let reset_at = now + ChronoDuration::seconds(window_start + window_secs - now_secs);

        Ok(Decision {
            allowed,
            remaining,
            reset_at,
            retry_after_secs: if allowed {
                None
            } else {
                Some((reset_at - now).num_seconds().max(0) as f64)
            },
            algorithm: AlgorithmTag::FixedWindow,
        })
    }

    async fn reset(&self, store: &dyn RateLimitStore, key: &str) -> Result<(), DecisionError> {
        let prefix = format!("ratelimit:fixed:{key}:");
        let matching = store.scan(&prefix).await?;
        store.delete(&matching).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            algorithm: AlgorithmTag::FixedWindow,
            capacity: 4,
            refill_rate: 4.0,
            refill_period_seconds: 10,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn four_per_window_then_deny_then_allow_in_next_window() {
        let store = MemoryStore::new();
        let strategy = FixedWindow::new();
        let cfg = config();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for i in 0..4 {
            let d = strategy.decide(&store, "k", 1, &cfg, t0).await.unwrap();
            assert!(d.allowed, "request {i} at t=0 should be allowed");
        }

        let at_9_9 = t0 + ChronoDuration::milliseconds(9_900);
        let denied = strategy.decide(&store, "k", 1, &cfg, at_9_9).await.unwrap();
        assert!(!denied.allowed);

        let at_10 = t0 + ChronoDuration::seconds(10);
        let allowed = strategy.decide(&store, "k", 1, &cfg, at_10).await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 3);
    }

    #[tokio::test]
    async fn boundary_anomaly_allows_up_to_double_capacity_across_seam() {
        let store = MemoryStore::new();
        let strategy = FixedWindow::new();
        let cfg = config();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let at_9_9 = t0 + ChronoDuration::milliseconds(9_900);
        let at_10_1 = t0 + ChronoDuration::milliseconds(10_100);

        let mut allowed_count = 0;
        for _ in 0..4 {
            if strategy.decide(&store, "k", 1, &cfg, at_9_9).await.unwrap().allowed {
                allowed_count += 1;
            }
        }
        for _ in 0..4 {
            if strategy.decide(&store, "k", 1, &cfg, at_10_1).await.unwrap().allowed {
                allowed_count += 1;
            }
        }
        assert_eq!(allowed_count, 2 * cfg.capacity as i32);
    }
}
