use crate::algorithms::build_registry;
use crate::config::ProcessConfig;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::resolver::ConfigResolver;
use crate::store::redis_store::PoolConfig as StorePoolConfig;
use crate::store::{MemoryStore, RateLimitStore, RedisStore};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Shared process state, cheaply cloneable. Composed of the pieces the HTTP
/// boundary needs: the orchestrator (decision path), the resolver (config
/// CRUD), the store (admin/health endpoints), and the metrics handle.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub resolver: Arc<ConfigResolver>,
    pub store: Arc<dyn RateLimitStore>,
    pub metrics: Metrics,
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    pub async fn new(config: ProcessConfig) -> Result<Self> {
        let store: Arc<dyn RateLimitStore> = if config.store_url.starts_with("memory://") {
            info!("store: using in-process MemoryStore (no Redis configured)");
            Arc::new(MemoryStore::new())
        } else {
            let pool = StorePoolConfig {
                max_active: config.pool.max_active,
                max_wait: config.pool.max_wait,
                command_timeout: config.pool.command_timeout,
            };
            let store = RedisStore::connect(&config.store_url, pool).await?;
            info!("store: connected, url={}", redact_url(&config.store_url));
            Arc::new(store)
        };

        let resolver = Arc::new(ConfigResolver::new(store.clone(), config.default_limit.clone()).await?);
        let registry = build_registry();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            resolver.clone(),
            registry,
            config.fail_open,
        ));

        // The recorder is always installed so `counter!`/`histogram!` calls
        // elsewhere in the codebase never panic; `metrics_enabled` only
        // gates whether operators bother scraping `/metrics`.
        let metrics = Metrics::install();

        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));

        Ok(Self {
            orchestrator,
            resolver,
            store,
            metrics,
            ready,
        })
    }

    /// Probe the store and mark the process ready if it answers. Called once
    /// during bootstrap before the listener starts accepting traffic.
    pub async fn warm_up(&self) -> Result<()> {
        self.store.ping().await?;
        self.ready.store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Relaxed)
    }
}

fn redact_url(url: &str) -> String {
    match url.find('@') {
        Some(at) => match url.find("://") {
            Some(scheme_end) => format!("{}://***{}", &url[..scheme_end], &url[at..]),
            None => "***".to_string(),
        },
        None => url.to_string(),
    }
}
