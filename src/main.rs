use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil::config::ConfigStore;
use vigil::engine::{build_engine, Engine};
use vigil::state::AppState;
use vigil::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vigil command line arguments
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version, about = "Triggered clip capture and on-demand WebRTC streaming", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON, created with defaults when missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    http_port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting vigil v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.unwrap_or_else(default_config_path);
    tracing::info!("Configuration: {}", config_path.display());
    let config_store = ConfigStore::new(&config_path).await?;
    let mut config = (*config_store.get()).clone();

    // CLI overrides are not persisted
    if let Some(addr) = args.address {
        config.web.bind_address = addr;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }

    let ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);

    let engine = Arc::new(build_engine(&config, Handle::current())?);
    {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.start()).await??;
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(config_store, engine.clone(), shutdown.clone());
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
    }
    shutdown.cancel();
    cleanup(engine).await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Finish open clips and stop data flow
async fn cleanup(engine: Arc<Engine>) {
    let handle = Handle::current();
    if let Err(e) = tokio::task::spawn_blocking(move || engine.shutdown(&handle)).await {
        tracing::warn!("Engine shutdown task failed: {}", e);
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vigil=error,tower_http=error",
        LogLevel::Warn => "vigil=warn,tower_http=warn",
        LogLevel::Info => "vigil=info,tower_http=info",
        LogLevel::Verbose => "vigil=debug,tower_http=info",
        LogLevel::Debug => "vigil=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "vigil=trace,tower_http=debug,webrtc=debug",
    };

    // RUST_LOG takes priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("VIGIL_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/vigil/vigil.json")
}
