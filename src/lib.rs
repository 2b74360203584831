pub mod agents;
pub mod config;
pub mod db;
pub mod errors;
pub mod messages;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod session;
pub mod stream;
pub mod threads;

use crate::config::{AppConfig, LoggingConfig};
use crate::server::AppState;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Loads configuration, starts logging and serves until shutdown.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        query_db = %config.query_db.path.display(),
        chat_db = ?config.chat_db.path,
        "starting sql matic server"
    );

    let state = AppState::from_config(config)?;
    server::run_server(state).await
}

/// `RUST_LOG` wins over the configured level. With a log directory, output
/// goes to a daily rolling file through a non-blocking writer.
pub fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let Some(log_dir) = &logging.dir else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = if logging.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        return result.map_err(|error| anyhow::anyhow!(error));
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "sql-matic.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
}
