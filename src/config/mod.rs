pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProcessConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the service to start with zero configuration for
    /// local development (against a `MemoryStore`).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProcessConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ProcessConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded process configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RATELIMITD_STORE_URL") {
            self.store_url = v;
        }
        if let Ok(v) = std::env::var("RATELIMITD_FAIL_OPEN") {
            self.fail_open = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RATELIMITD_POOL_MAX_ACTIVE") {
            if let Ok(n) = v.parse::<usize>() {
                self.pool.max_active = n;
            }
        }
        if let Ok(v) = std::env::var("RATELIMITD_DEFAULT_CAPACITY") {
            if let Ok(n) = v.parse::<u64>() {
                self.default_limit.capacity = n;
            }
        }
        if let Ok(v) = std::env::var("RATELIMITD_DEFAULT_REFILL_RATE") {
            if let Ok(n) = v.parse::<f64>() {
                self.default_limit.refill_rate = n;
            }
        }
        if let Ok(v) = std::env::var("RATELIMITD_METRICS_ENABLED") {
            self.metrics_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RATELIMITD_DETAILED_LOGGING") {
            self.detailed_logging = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_url.is_empty() {
            anyhow::bail!("store_url cannot be empty");
        }
        if self.pool.max_active == 0 {
            anyhow::bail!("pool.max_active must be positive");
        }
        if self.default_limit.capacity == 0 {
            anyhow::bail!("default_limit.capacity must be positive");
        }
        if self.default_limit.refill_rate <= 0.0 {
            anyhow::bail!("default_limit.refill_rate must be positive");
        }
        Ok(())
    }
}
