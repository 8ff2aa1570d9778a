//! mongo-exporter - Prometheus exporter for MongoDB.
//!
//! Every scrape of `/metrics` runs one collection cycle against the
//! configured server; there is no internal timer.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod logging;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches, Parser};
use mongo_exporter_core::{CollectorManager, DiagnosticClient, MongoClient};
use tracing::{error, info, warn};

use config::Config;
use server::AppState;

/// Prometheus exporter for MongoDB.
#[derive(Parser)]
#[command(name = "mongo-exporter", version, about = "Prometheus exporter for MongoDB")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MONGO_EXPORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (`host:port`), overrides `server.address`/`server.port`.
    #[arg(long)]
    listen: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Commit the binary was built from, `unknown` when neither git nor
/// `GIT_COMMIT` was available at build time.
const GIT_COMMIT: &str = env!("GIT_COMMIT");
const BUILD_TIME: &str = env!("BUILD_TIME");

fn long_version() -> String {
    format!(
        "{}\nBuild Time: {}\nGit Commit: {}",
        mongo_exporter_core::VERSION,
        BUILD_TIME,
        GIT_COMMIT
    )
}

fn command() -> clap::Command {
    let version: &'static str = Box::leak(long_version().into_boxed_str());
    Args::command().long_version(version)
}

fn parse_args() -> Args {
    let matches = command().get_matches();
    Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
}

fn main() -> ExitCode {
    let args = parse_args();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mongo-exporter: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.logging, args.verbose, args.quiet) {
        eprintln!(
            "mongo-exporter: failed to open log file {}: {}",
            config.logging.output_path, e
        );
        return ExitCode::FAILURE;
    }

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen_addr());
    info!(
        version = mongo_exporter_core::VERSION,
        build_time = BUILD_TIME,
        git_commit = GIT_COMMIT,
        config = ?args.config,
        "starting mongo-exporter"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async_main(config, listen))
}

async fn async_main(config: Config, listen: String) -> ExitCode {
    let settings = match config.connection_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid connection settings");
            return ExitCode::FAILURE;
        }
    };
    let client = match tokio::task::spawn_blocking(move || MongoClient::connect(&settings)).await {
        Ok(Ok(client)) => client,
        Ok(Err(e)) => {
            error!(error = %e, "failed to connect to MongoDB");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "connect panicked in spawn_blocking");
            return ExitCode::FAILURE;
        }
    };

    let client: Arc<dyn DiagnosticClient> = Arc::new(client);
    let manager = Arc::new(
        CollectorManager::new(client, config.collector_config()).with_timeouts(config.timeouts()),
    );
    if let Err(e) = manager.initialize() {
        error!(error = %e, "failed to initialize collectors");
        return ExitCode::FAILURE;
    }

    let registry = prometheus::Registry::new();
    if let Err(e) = registry.register(Box::new(manager.bridge())) {
        error!(error = %e, "failed to register collectors");
        return ExitCode::FAILURE;
    }

    let state = AppState {
        manager: Arc::clone(&manager),
        registry: Arc::new(registry),
        ping_timeout: config.mongodb.connection_timeout,
    };
    let app = server::router(state, config.server.write_timeout);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %listen, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(
        addr = %listen,
        collection_interval = %humantime::format_duration(config.metrics.collection_interval),
        collectors = manager.fan_out().len(),
        "listening"
    );

    let result = server::serve(
        listener,
        app,
        config.server.connection_limits(),
        shutdown_signal(),
    )
    .await;
    manager.shutdown();
    match result {
        Ok(()) => {
            info!("exporter stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("received shutdown signal, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_version_lists_build_info() {
        let version = long_version();
        let lines: Vec<&str> = version.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], mongo_exporter_core::VERSION);
        assert!(lines[1].starts_with("Build Time: "));
        assert_eq!(lines[2], format!("Git Commit: {}", GIT_COMMIT));
        assert!(!GIT_COMMIT.is_empty());
    }

    #[test]
    fn test_long_version_flag() {
        let err = command()
            .try_get_matches_from(["mongo-exporter", "--version"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains("Git Commit: "));
    }
}
