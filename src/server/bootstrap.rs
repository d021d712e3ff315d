use crate::server::{self, AppState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub store_url: Option<String>,
}

/// Process lifecycle: init → load config → connect store → warm up → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: load configuration (file + env overrides) and build shared state.
    // A `--store-url` flag takes precedence over both the file and
    // `RATELIMITD_STORE_URL`, matching clap's usual last-writer-wins CLI
    // override semantics.
    let mut config = crate::config::ProcessConfig::load(&args.config_path)?;
    if let Some(store_url) = args.store_url {
        config.store_url = store_url;
    }
    let state = AppState::new(config).await?;

    // Phase 2: warm up — ping the store before accepting traffic. A failure
    // here is fatal; a store that's unreachable at boot will not become
    // reachable by the time the first request lands.
    state.warm_up().await?;
    tracing::info!("bootstrap: store reachable, ready to accept traffic");

    // Phase 3: start the listener.
    let shutdown = Arc::new(Notify::new());
    tracing::info!("server: starting, listen={}", args.listen);

    let server_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run(&listen, state, shutdown).await }
    });

    // Phase 4: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = server_handle.await {
        tracing::error!("server: task join error, error={}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
