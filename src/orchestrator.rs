use crate::algorithms::{AlgorithmRegistry, Decision};
use crate::error::DecisionError;
use crate::resolver::ConfigResolver;
use crate::store::RateLimitStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Resolve -> dispatch -> time -> apply failure policy -> record metrics.
/// Stateless and re-entrant; any number of callers may drive it concurrently.
pub struct Orchestrator {
    store: Arc<dyn RateLimitStore>,
    resolver: Arc<ConfigResolver>,
    registry: AlgorithmRegistry,
    fail_open: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        resolver: Arc<ConfigResolver>,
        registry: AlgorithmRegistry,
        fail_open: bool,
    ) -> Self {
        Self {
            store,
            resolver,
            registry,
            fail_open,
        }
    }

    pub async fn check(&self, key: &str, tokens: u64) -> Result<Decision, DecisionError> {
        if key.trim().is_empty() {
            return Err(DecisionError::InvalidInput("key must not be blank".into()));
        }
        if tokens == 0 {
            return Err(DecisionError::InvalidInput("tokens must be positive".into()));
        }

        let config = self.resolver.get_config(key).await?;

        let strategy = self.registry.get(&config.algorithm).ok_or_else(|| {
            DecisionError::Internal(format!(
                "no strategy registered for algorithm {}",
                config.algorithm
            ))
        })?;

        let now = Utc::now();
        let started = Instant::now();
        let result = strategy
            .decide(self.store.as_ref(), key, tokens, &config, now)
            .await;
        let elapsed = started.elapsed();

        metrics::histogram!(
            "ratelimit_decision_duration_seconds",
            "algorithm" => config.algorithm.as_str(),
        )
        .record(elapsed.as_secs_f64());

        match result {
            Ok(decision) => {
                metrics::counter!(
                    "ratelimit_decisions_total",
                    "algorithm" => config.algorithm.as_str(),
                    "result" => if decision.allowed { "allowed" } else { "denied" },
                )
                .increment(1);
                Ok(decision)
            }
            Err(e) if e.is_store_failure() => {
                warn!(
                    "orchestrator: store failure, key={key}, kind={}, error={e}",
                    e.metric_kind()
                );
                metrics::counter!(
                    "ratelimit_store_errors_total",
                    "kind" => e.metric_kind(),
                )
                .increment(1);

                if self.fail_open {
                    metrics::counter!(
                        "ratelimit_decisions_total",
                        "algorithm" => config.algorithm.as_str(),
                        "result" => "allowed_fail_open",
                    )
                    .increment(1);
                    Ok(Decision {
                        allowed: true,
                        remaining: -1,
                        reset_at: now + ChronoDuration::seconds(config.refill_period_seconds as i64),
                        retry_after_secs: None,
                        algorithm: config.algorithm,
                    })
                } else {
                    metrics::counter!(
                        "ratelimit_decisions_total",
                        "algorithm" => config.algorithm.as_str(),
                        "result" => "denied_fail_closed",
                    )
                    .increment(1);
                    Ok(Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at: now + ChronoDuration::seconds(60),
                        retry_after_secs: Some(60.0),
                        algorithm: config.algorithm,
                    })
                }
            }
            Err(e) => {
                error!("orchestrator: non-recoverable error, key={key}, error={e}");
                Err(e)
            }
        }
    }

    pub async fn reset(&self, key: &str) -> Result<(), DecisionError> {
        let config = self.resolver.get_config(key).await?;
        let strategy = self.registry.get(&config.algorithm).ok_or_else(|| {
            DecisionError::Internal(format!(
                "no strategy registered for algorithm {}",
                config.algorithm
            ))
        })?;
        strategy.reset(self.store.as_ref(), key).await
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::build_registry;
    use crate::config::{DefaultLimitConfig, RateLimitConfig};
    use crate::store::MemoryStore;

    async fn orchestrator_with_memory_store() -> Orchestrator {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
        let resolver = Arc::new(
            ConfigResolver::new(store.clone(), DefaultLimitConfig::default())
                .await
                .unwrap(),
        );
        Orchestrator::new(store, resolver, build_registry(), true)
    }

    #[tokio::test]
    async fn rejects_blank_key_and_zero_tokens() {
        let orch = orchestrator_with_memory_store().await;
        assert!(orch.check("", 1).await.is_err());
        assert!(orch.check("a", 0).await.is_err());
    }

    #[tokio::test]
    async fn remaining_never_negative_on_success_path() {
        let orch = orchestrator_with_memory_store().await;
        orch.resolver()
            .save_key_config(
                "k",
                RateLimitConfig {
                    algorithm: crate::algorithms::AlgorithmTag::TokenBucket,
                    capacity: 3,
                    refill_rate: 1.0,
                    refill_period_seconds: 60,
                    key_pattern: None,
                    priority: None,
                    created_at: None,
                    updated_at: None,
                },
            )
            .await
            .unwrap();

        for _ in 0..3 {
            let d = orch.check("k", 1).await.unwrap();
            assert!(d.allowed);
            assert!(d.remaining >= 0);
        }
        let denied = orch.check("k", 1).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.remaining >= 0);
    }
}
