use crate::algorithms::AlgorithmTag;
use crate::config::{DefaultLimitConfig, RateLimitConfig};
use crate::error::DecisionError;
use crate::pattern::{self, CompiledPattern};
use crate::store::RateLimitStore;
use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const KEY_PREFIX: &str = "config:key:";
const PATTERN_PREFIX: &str = "config:pattern:";
const KEY_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Exact key -> pattern -> default lookup, with an in-process cache over
/// both exact keys and the compiled pattern set. Reads are lock-free
/// (`DashMap` fast path, `ArcSwap::load`); all mutations are serialized
/// through `mutate_mu` so concurrent saves/deletes can't race each other,
/// mirroring the `config_mu`-guarded hot-reload idiom used elsewhere in this
/// codebase.
pub struct ConfigResolver {
    store: Arc<dyn RateLimitStore>,
    default: DefaultLimitConfig,
    exact_cache: DashMap<String, Arc<RateLimitConfig>>,
    patterns: Arc<ArcSwap<Vec<CompiledPattern>>>,
    mutate_mu: Mutex<()>,
}

impl ConfigResolver {
    pub async fn new(
        store: Arc<dyn RateLimitStore>,
        default: DefaultLimitConfig,
    ) -> Result<Self, DecisionError> {
        let resolver = Self {
            store,
            default,
            exact_cache: DashMap::new(),
            patterns: Arc::new(ArcSwap::new(Arc::new(Vec::new()))),
            mutate_mu: Mutex::new(()),
        };
        resolver.reload_configurations().await?;
        Ok(resolver)
    }

    pub async fn get_config(&self, key: &str) -> Result<Arc<RateLimitConfig>, DecisionError> {
        if let Some(cfg) = self.exact_cache.get(key) {
            metrics::counter!("ratelimit_config_cache_hits_total").increment(1);
            return Ok(cfg.clone());
        }
        metrics::counter!("ratelimit_config_cache_misses_total").increment(1);

        let store_key = format!("{KEY_PREFIX}{key}");
        if let Some(fields) = self.store.get_hash(&store_key).await? {
            match decode_config(&fields, Some(key)) {
                Ok(cfg) => {
                    let cfg = Arc::new(cfg);
                    self.exact_cache.insert(key.to_string(), cfg.clone());
                    return Ok(cfg);
                }
                Err(e) => {
                    tracing::warn!("resolver: malformed key config, key={key}, error={e}");
                }
            }
        }

        let patterns = self.patterns.load();
        if let Some(pat) = pattern::find_best_match(key, &patterns) {
            let store_key = format!("{PATTERN_PREFIX}{}", pat.literal);
            if let Some(fields) = self.store.get_hash(&store_key).await? {
                match decode_config(&fields, Some(&pat.literal)) {
                    Ok(cfg) => {
                        let cfg = Arc::new(cfg);
                        self.exact_cache.insert(key.to_string(), cfg.clone());
                        return Ok(cfg);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "resolver: malformed pattern config, pattern={}, error={e}",
                            pat.literal
                        );
                    }
                }
            }
        }

        Ok(Arc::new(RateLimitConfig::default_policy(&self.default)))
    }

    pub async fn save_key_config(&self, key: &str, mut cfg: RateLimitConfig) -> Result<(), DecisionError> {
        cfg.validate().map_err(DecisionError::InvalidInput)?;
        let _guard = self.mutate_mu.lock().await;

        cfg.key_pattern = Some(key.to_string());
        cfg.updated_at = Some(Utc::now());
        if cfg.created_at.is_none() {
            cfg.created_at = Some(Utc::now());
        }

        let store_key = format!("{KEY_PREFIX}{key}");
        self.store
            .set_hash(&store_key, &encode_config(&cfg), KEY_TTL)
            .await?;
        self.exact_cache.remove(key);
        info!("resolver: key config saved, key={key}");
        Ok(())
    }

    pub async fn save_pattern_config(
        &self,
        pattern_literal: &str,
        mut cfg: RateLimitConfig,
    ) -> Result<(), DecisionError> {
        cfg.validate().map_err(DecisionError::InvalidInput)?;
        let _guard = self.mutate_mu.lock().await;

        cfg.key_pattern = Some(pattern_literal.to_string());
        if cfg.priority.is_none() {
            cfg.priority = Some(pattern::priority_of(pattern_literal));
        }
        cfg.updated_at = Some(Utc::now());
        if cfg.created_at.is_none() {
            cfg.created_at = Some(Utc::now());
        }

        let store_key = format!("{PATTERN_PREFIX}{pattern_literal}");
        self.store
            .set_hash(&store_key, &encode_config(&cfg), KEY_TTL)
            .await?;

        self.rebuild_pattern_cache().await?;
        // A pattern change may reroute any key, so every exact-key cache
        // entry must be invalidated, not just the ones touching this pattern.
        self.exact_cache.clear();
        info!("resolver: pattern config saved, pattern={pattern_literal}");
        Ok(())
    }

    pub async fn delete_key_config(&self, key: &str) -> Result<(), DecisionError> {
        let _guard = self.mutate_mu.lock().await;
        let store_key = format!("{KEY_PREFIX}{key}");
        self.store.delete(&[store_key]).await?;
        self.exact_cache.remove(key);
        info!("resolver: key config deleted, key={key}");
        Ok(())
    }

    pub async fn delete_pattern_config(&self, pattern_literal: &str) -> Result<(), DecisionError> {
        let _guard = self.mutate_mu.lock().await;
        let store_key = format!("{PATTERN_PREFIX}{pattern_literal}");
        self.store.delete(&[store_key]).await?;
        self.rebuild_pattern_cache().await?;
        self.exact_cache.clear();
        info!("resolver: pattern config deleted, pattern={pattern_literal}");
        Ok(())
    }

    /// Scan `config:pattern:*` and decode every hash found. Does not take
    /// `mutate_mu` — safe to call from both the public listing endpoint and
    /// `rebuild_pattern_cache`, which already holds the lock itself.
    pub async fn get_all_patterns(&self) -> Result<Vec<RateLimitConfig>, DecisionError> {
        let keys = self.store.scan(PATTERN_PREFIX).await?;
        let mut configs = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(fields) = self.store.get_hash(&k).await? {
                let literal = k.strip_prefix(PATTERN_PREFIX).unwrap_or(&k);
                if let Ok(cfg) = decode_config(&fields, Some(literal)) {
                    configs.push(cfg);
                }
            }
        }
        Ok(configs)
    }

    /// Drop both caches and rebuild the compiled-pattern set from the store.
    pub async fn reload_configurations(&self) -> Result<(), DecisionError> {
        let _guard = self.mutate_mu.lock().await;
        self.exact_cache.clear();
        let result = self.rebuild_pattern_cache().await;
        metrics::counter!(
            "ratelimit_config_reloads_total",
            "result" => if result.is_ok() { "success" } else { "error" },
        )
        .increment(1);
        result
    }

    async fn rebuild_pattern_cache(&self) -> Result<(), DecisionError> {
        let configs = self.get_all_patterns().await?;
        let mut compiled = Vec::with_capacity(configs.len());
        for cfg in configs {
            let Some(literal) = cfg.key_pattern else {
                continue;
            };
            match CompiledPattern::compile(&literal, cfg.priority) {
                Ok(c) => compiled.push(c),
                Err(e) => tracing::warn!("resolver: bad pattern, pattern={literal}, error={e}"),
            }
        }
        metrics::gauge!("ratelimit_patterns_total").set(compiled.len() as f64);
        self.patterns.store(Arc::new(compiled));
        Ok(())
    }
}

fn encode_config(cfg: &RateLimitConfig) -> Vec<(String, String)> {
    let mut fields = vec![
        ("algorithm".to_string(), cfg.algorithm.as_str().to_string()),
        ("capacity".to_string(), cfg.capacity.to_string()),
        ("refill_rate".to_string(), cfg.refill_rate.to_string()),
        (
            "refill_period_seconds".to_string(),
            cfg.refill_period_seconds.to_string(),
        ),
    ];
    if let Some(p) = cfg.priority {
        fields.push(("priority".to_string(), p.to_string()));
    }
    if let Some(ref kp) = cfg.key_pattern {
        fields.push(("key_pattern".to_string(), kp.clone()));
    }
    if let Some(ts) = cfg.created_at {
        fields.push(("created_at".to_string(), ts.to_rfc3339()));
    }
    if let Some(ts) = cfg.updated_at {
        fields.push(("updated_at".to_string(), ts.to_rfc3339()));
    }
    fields
}

/// Decode a config hash read back from the store. Any malformed field —
/// missing, unparseable, or violating `RateLimitConfig::validate` — is
/// surfaced as `DecisionError::ConfigDecode` (§7 kind 2); callers log it and
/// fall through to the next resolution tier rather than propagating it.
fn decode_config(
    fields: &[(String, String)],
    fallback_pattern: Option<&str>,
) -> Result<RateLimitConfig, DecisionError> {
    let get = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
    let decode_err = |msg: String| DecisionError::ConfigDecode(msg);

    let algorithm = match get("algorithm") {
        Some("token_bucket") => AlgorithmTag::TokenBucket,
        Some("sliding_window") => AlgorithmTag::SlidingWindow,
        Some("sliding_window_counter") => AlgorithmTag::SlidingWindowCounter,
        Some("fixed_window") => AlgorithmTag::FixedWindow,
        Some("leaky_bucket") => AlgorithmTag::LeakyBucket,
        Some(other) => return Err(decode_err(format!("unknown algorithm: {other}"))),
        None => return Err(decode_err("missing algorithm field".to_string())),
    };

    let capacity = get("capacity")
        .ok_or_else(|| decode_err("missing capacity".to_string()))?
        .parse::<u64>()
        .map_err(|e| decode_err(e.to_string()))?;
    let refill_rate = get("refill_rate")
        .ok_or_else(|| decode_err("missing refill_rate".to_string()))?
        .parse::<f64>()
        .map_err(|e| decode_err(e.to_string()))?;
    let refill_period_seconds = get("refill_period_seconds")
        .ok_or_else(|| decode_err("missing refill_period_seconds".to_string()))?
        .parse::<u64>()
        .map_err(|e| decode_err(e.to_string()))?;
    let priority = get("priority").and_then(|v| v.parse::<i64>().ok());
    let key_pattern = get("key_pattern")
        .map(|s| s.to_string())
        .or_else(|| fallback_pattern.map(|s| s.to_string()));
    let created_at = get("created_at").and_then(|v| v.parse().ok());
    let updated_at = get("updated_at").and_then(|v| v.parse().ok());

    let cfg = RateLimitConfig {
        algorithm,
        capacity,
        refill_rate,
        refill_period_seconds,
        key_pattern,
        priority,
        created_at,
        updated_at,
    };
    cfg.validate().map_err(decode_err)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn token_bucket_cfg(capacity: u64) -> RateLimitConfig {
        RateLimitConfig {
            algorithm: AlgorithmTag::TokenBucket,
            capacity,
            refill_rate: 10.0,
            refill_period_seconds: 60,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn falls_back_to_default_when_nothing_matches() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
        let resolver = ConfigResolver::new(store, DefaultLimitConfig::default())
            .await
            .unwrap();
        let cfg = resolver.get_config("unknown:key").await.unwrap();
        assert_eq!(cfg.capacity, DefaultLimitConfig::default().capacity);
    }

    #[tokio::test]
    async fn save_key_round_trips() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
        let resolver = ConfigResolver::new(store, DefaultLimitConfig::default())
            .await
            .unwrap();

        resolver
            .save_key_config("user:1", token_bucket_cfg(42))
            .await
            .unwrap();
        let cfg = resolver.get_config("user:1").await.unwrap();
        assert_eq!(cfg.capacity, 42);
    }

    #[tokio::test]
    async fn pattern_priority_wins_over_broader_pattern() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::new());
        let resolver = ConfigResolver::new(store, DefaultLimitConfig::default())
            .await
            .unwrap();

        resolver
            .save_pattern_config("user:*", token_bucket_cfg(10))
            .await
            .unwrap();
        resolver
            .save_pattern_config("user:premium:*", token_bucket_cfg(50))
            .await
            .unwrap();

        let premium = resolver.get_config("user:premium:42").await.unwrap();
        assert_eq!(premium.capacity, 50);

        let free = resolver.get_config("user:free:42").await.unwrap();
        assert_eq!(free.capacity, 10);

        resolver.delete_pattern_config("user:premium:*").await.unwrap();
        let now_free = resolver.get_config("user:premium:42").await.unwrap();
        assert_eq!(now_free.capacity, 10);
    }

    #[tokio::test]
    async fn reload_configurations_picks_up_store_changes() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn RateLimitStore> = store.clone();
        let resolver = ConfigResolver::new(dyn_store.clone(), DefaultLimitConfig::default())
            .await
            .unwrap();

        resolver
            .save_pattern_config("order:*", token_bucket_cfg(7))
            .await
            .unwrap();
        resolver.reload_configurations().await.unwrap();

        let cfg = resolver.get_config("order:99").await.unwrap();
        assert_eq!(cfg.capacity, 7);
    }
}
