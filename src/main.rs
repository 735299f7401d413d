use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bouncer::admission::Admission;
use bouncer::clock::{Clock, SystemClock};
use bouncer::config::{BouncerConfig, StoreBackend};
use bouncer::http::{AppState, HttpServer};
use bouncer::store::{CounterStore, MemoryStore, RedisStore, RedisStoreConfig};
use bouncer::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Request admission and abuse mitigation sidecar.
#[derive(Debug, Parser)]
#[command(name = "bouncer", version, about)]
struct Args {
    /// YAML configuration file, layered under BOUNCER__* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Bouncer admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = BouncerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    info!(
        bind_addr = %config.server.bind_addr,
        backend = ?config.store.backend,
        fail_open = config.admission.fail_open,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            spawn_sweeper(
                memory.clone(),
                clock.clone(),
                Duration::from_millis(config.store.sweep_interval_ms),
            );
            memory as Arc<dyn CounterStore>
        }
        StoreBackend::Redis => {
            // Serve degraded while Redis is unreachable instead of refusing to start
            let redis = RedisStore::connect_lazy(
                &config.store.url,
                RedisStoreConfig {
                    key_prefix: config.store.key_prefix.clone(),
                    scripting: !config.store.force_pipelined,
                },
            )?;
            info!("Connecting to Redis counter store in the background");
            Arc::new(redis)
        }
    };

    let (telemetry, telemetry_worker) = Telemetry::spawn(&config.telemetry);
    let admission = Admission::from_config(&config, store, clock, telemetry.clone());
    let state = Arc::new(AppState { admission });

    HttpServer::new(config.server.bind_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    telemetry.flush().await;
    let stats = telemetry.snapshot();
    info!(
        allowed = stats.allowed,
        rejected = stats.rejected,
        degraded = stats.degraded,
        dropped_events = stats.dropped_events,
        "Final admission statistics"
    );
    telemetry_worker.abort();

    info!("Bouncer admission service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_thread_ids(true))
            .with(filter)
            .init(),
    }
}

/// Periodically drop expired records from the in-memory store.
fn spawn_sweeper(store: Arc<MemoryStore>, clock: Arc<dyn Clock>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = store.purge_expired(clock.now_ms());
            if removed > 0 {
                info!(removed, remaining = store.len(), "Swept expired records");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
