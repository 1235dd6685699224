use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ratewall::config::{RatewallConfig, StoreBackend, StoreConfig};
use ratewall::http::{app, HttpServer, IdentityExtractor, RateLimitState};
use ratewall::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

/// Fixed-window HTTP rate limiter.
#[derive(Debug, Parser)]
#[command(name = "ratewall", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWALL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Ratewall");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatewallConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    let policy = config.policy()?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        ip_max_requests = policy.default_ip().max_requests(),
        ip_window = ?policy.default_ip().window(),
        token_limits = config.limits.tokens.len(),
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let limiter =
        Arc::new(RateLimiter::new(store, policy).with_store_timeout(config.store.timeout()));
    let extractor = IdentityExtractor::new(&config.limits.credential_header)?;
    info!("Rate limiter initialized");

    let server = HttpServer::bind(
        config.server.listen_addr,
        app(RateLimitState::new(limiter, extractor)),
    )
    .await?;

    server
        .serve_with_shutdown(
            shutdown_signal(),
            Duration::from_secs(config.server.shutdown_timeout_secs),
        )
        .await?;

    info!("Ratewall stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Create the configured counting store.
async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Redis => {
            info!(url = %config.redis_url, "Connecting to Redis");
            let store = RedisStore::connect(&config.redis_url, config.connect_timeout()).await?;
            Ok(Arc::new(store) as Arc<dyn CounterStore>)
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_sweeper(store.clone(), config.sweep_interval());
            info!("Using in-memory counting store");
            Ok(store as Arc<dyn CounterStore>)
        }
    }
}

/// Periodically drop expired in-memory counters.
fn spawn_sweeper(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            debug!(removed, remaining = store.len(), "Swept in-memory counters");
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
