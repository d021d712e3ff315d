use super::{expect_i64, AlgorithmTag, Decision, RateLimitAlgorithm};
use crate::config::RateLimitConfig;
use crate::error::DecisionError;
use crate::store::{RateLimitStore, ScriptId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Constant-memory approximation of the sliding window: blends the previous
/// window's count (weighted by how much of it still overlaps "now") with the
/// current window's count.
pub struct SlidingWindowCounter;

impl SlidingWindowCounter {
    pub fn new() -> Self {
        Self
    }

    fn keys(key: &str, window_start_ms: i64, window_ms: i64) -> (String, String) {
        (
            format!("ratelimit:swc:{key}:{window_start_ms}"),
            format!("ratelimit:swc:{key}:{}", window_start_ms - window_ms),
        )
    }
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowCounter {
    fn tag(&self) -> AlgorithmTag {
        AlgorithmTag::SlidingWindowCounter
    }

    async fn decide(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        tokens: u64,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, DecisionError> {
        // Millisecond precision throughout: window boundaries still land on
        // whole-second marks (refillPeriodSeconds is always whole seconds),
        // but "now" keeps its sub-second offset into the window, which the
        // weighting formula needs (a request 500ms into a 2s window has
        // prevWeight = 0.75, not 1.0 — truncating to whole seconds here
        // would round that away).
        let window_ms = config.refill_period_seconds as i64 * 1000;
        let now_ms = now.timestamp_millis();
        let window_start_ms = now_ms - now_ms.rem_euclid(window_ms);
        let (cur_key, prev_key) = Self::keys(key, window_start_ms, window_ms);

        let keys = vec![cur_key, prev_key];
        let args = vec![
            config.capacity.to_string(),
            window_ms.to_string(),
            now_ms.to_string(),
            tokens.to_string(),
            window_start_ms.to_string(),
            (config.refill_period_seconds * 2).to_string(),
        ];

        let reply = store
            .exec_script(ScriptId::SlidingWindowCounter, &keys, &args)
            .await?;
        let allowed = expect_i64(&reply, 0, "allowed")? == 1;
        let weighted_x1000 = expect_i64(&reply, 1, "weighted")?;
        let weighted = weighted_x1000 as f64 / 1000.0;
        let remaining = (config.capacity as f64 - weighted).max(0.0).floor() as i64;
        let reset_at = now + ChronoDuration::milliseconds(window_start_ms + window_ms - now_ms);

        Ok(Decision {
            allowed,
            remaining,
            reset_at,
            retry_after_secs: if allowed {
                None
            } else {
                Some((reset_at - now).num_milliseconds().max(0) as f64 / 1000.0)
            },
            algorithm: AlgorithmTag::SlidingWindowCounter,
        })
    }

    async fn reset(&self, store: &dyn RateLimitStore, key: &str) -> Result<(), DecisionError> {
        let prefix = format!("ratelimit:swc:{key}:");
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
            algorithm: AlgorithmTag::SlidingWindowCounter,
            capacity: 5,
            refill_rate: 5.0,
            refill_period_seconds: 2,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn weighted_count_blends_previous_window_across_the_seam() {
        let store = MemoryStore::new();
        let strategy = SlidingWindowCounter::new();
        let cfg = config();
        // t0 lands exactly on a 2-second window boundary.
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for i in 0..5 {
            let d = strategy.decide(&store, "k", 1, &cfg, t0).await.unwrap();
            assert!(d.allowed, "request {i} in window k should be allowed");
        }

        // 0.5s into window k+1: prevWeight = (2 - 0.5) / 2 = 0.75, weighted = 5*0.75 = 3.75.
        let half_into_next = t0 + ChronoDuration::seconds(2) + ChronoDuration::milliseconds(500);
        let allowed = strategy
            .decide(&store, "k", 1, &cfg, half_into_next)
            .await
            .unwrap();
        assert!(allowed.allowed, "one more request should fit under 3.75 + 1 <= 5");

        let denied = strategy
            .decide(&store, "k", 1, &cfg, half_into_next)
            .await
            .unwrap();
        assert!(!denied.allowed, "a second extra request should not fit");
    }
}
