use crate::algorithms::AlgorithmTag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_capacity() -> u64 {
    100
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_refill_period_seconds() -> u64 {
    60
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// A rate-limit policy for one bucket key or pattern. Saved under
/// `config:key:<key>` or `config:pattern:<pattern>` in the shared store and
/// cached in-process by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub algorithm: AlgorithmTag,
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default = "default_refill_period_seconds")]
    pub refill_period_seconds: u64,
    /// The literal key or wildcard pattern this config was registered under.
    /// Derived from the store key suffix on decode if absent.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub key_pattern: Option<String>,
    /// Priority for pattern tie-breaks; computed by `pattern::priority_of`
    /// if left unset at save time.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be positive".into());
        }
        if self.refill_rate <= 0.0 {
            return Err("refill_rate must be positive".into());
        }
        if self.refill_period_seconds == 0 {
            return Err("refill_period_seconds must be positive".into());
        }
        if self.algorithm == AlgorithmTag::SlidingWindow && self.capacity > 10_000 {
            return Err("sliding window (log) capacity is bounded at 10000".into());
        }
        Ok(())
    }

    pub fn default_policy(default: &DefaultLimitConfig) -> Self {
        Self {
            algorithm: AlgorithmTag::TokenBucket,
            capacity: default.capacity,
            refill_rate: default.refill_rate,
            refill_period_seconds: default.refill_period_seconds,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Default policy applied when neither an exact key nor any pattern matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimitConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default = "default_refill_period_seconds")]
    pub refill_period_seconds: u64,
}

impl Default for DefaultLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            refill_period_seconds: default_refill_period_seconds(),
        }
    }
}

/// Redis connection pool sizing, mirroring the gateway's keepalive pool
/// knobs but applied to the rate-limit store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: std::time::Duration,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: std::time::Duration,
}

fn default_max_active() -> usize {
    64
}
fn default_max_idle() -> usize {
    16
}
fn default_min_idle() -> usize {
    1
}
fn default_max_wait() -> std::time::Duration {
    std::time::Duration::from_millis(500)
}
fn default_command_timeout() -> std::time::Duration {
    std::time::Duration::from_millis(500)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            max_wait: default_max_wait(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// In-process cache sizing for the configuration resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_config_ttl", with = "humantime_serde")]
    pub config_ttl: std::time::Duration,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub enable_stats: bool,
}

fn default_config_ttl() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}
fn default_cache_max_size() -> usize {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            config_ttl: default_config_ttl(),
            max_size: default_cache_max_size(),
            enable_stats: false,
        }
    }
}

/// Top-level process configuration, loaded from an optional TOML/JSON file
/// and then overridden from environment variables — see `ProcessConfig::load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub default_limit: DefaultLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Whether a store failure is treated as allow (`true`) or deny
    /// (`false`). A boot-time decision, never per-request.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default)]
    pub detailed_logging: bool,
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_fail_open() -> bool {
    true
}
fn default_true() -> bool {
    true
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            pool: PoolConfig::default(),
            default_limit: DefaultLimitConfig::default(),
            cache: CacheConfig::default(),
            fail_open: default_fail_open(),
            metrics_enabled: true,
            detailed_logging: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_config_defaults_fill_in_missing_fields() {
        let json = r#"{"algorithm":"TOKEN_BUCKET"}"#;
        let cfg: RateLimitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.capacity, default_capacity());
        assert_eq!(cfg.refill_rate, default_refill_rate());
        assert_eq!(cfg.refill_period_seconds, default_refill_period_seconds());
        assert!(cfg.key_pattern.is_none());
    }

    #[test]
    fn rate_limit_config_rejects_zero_capacity() {
        let cfg = RateLimitConfig {
            algorithm: AlgorithmTag::TokenBucket,
            capacity: 0,
            refill_rate: 1.0,
            refill_period_seconds: 60,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rate_limit_config_rejects_oversized_sliding_window() {
        let cfg = RateLimitConfig {
            algorithm: AlgorithmTag::SlidingWindow,
            capacity: 20_000,
            refill_rate: 1.0,
            refill_period_seconds: 60,
            key_pattern: None,
            priority: None,
            created_at: None,
            updated_at: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn process_config_default_is_fail_open() {
        let cfg = ProcessConfig::default();
        assert!(cfg.fail_open);
        assert_eq!(cfg.store_url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn process_config_toml_round_trip_with_partial_fields() {
        let toml_src = r#"
            store_url = "redis://cache:6379"
            fail_open = false

            [default_limit]
            capacity = 50
        "#;
        let cfg: ProcessConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.store_url, "redis://cache:6379");
        assert!(!cfg.fail_open);
        assert_eq!(cfg.default_limit.capacity, 50);
        assert_eq!(cfg.default_limit.refill_rate, default_refill_rate());
        assert_eq!(cfg.pool.max_active, default_max_active());
    }
}
