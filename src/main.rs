//! Database backup ingestion service
//!
//! Restores PostgreSQL backups either by watching a drop directory or from a
//! single JSON command read on stdin.

// backup-ingest/src/main.rs
mod archiver;
mod cli;
mod config;
mod errors;
mod exit_codes;
mod extract;
mod fetch;
mod monitor;
mod notify;
mod pipeline;
mod restore;
mod utils;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::protocol::{self, Envelope, EnvelopeWriter, ProgressNotifier};
use cli::{Cli, Mode};
use config::{AppConfig, LoggingSettings};
use errors::PipelineError;
use exit_codes::exit;
use monitor::DirectoryMonitor;
use notify::{JsonStreamNotifier, LogNotifier, Notifiers};
use pipeline::JobRunner;
use restore::{PgRestoreExecutor, RestoreExecutor};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let code = match run_app(cli.resolved_mode()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            exit::FAILURE
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run_app(mode: Mode) -> Result<i32> {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) if mode == Mode::Restore => {
            // The caller only reads stdout; report the failure there too.
            EnvelopeWriter::stdout().emit(configuration_envelope(&e));
            return Err(e).context("Failed to load configuration from the environment");
        }
        Err(e) => return Err(e).context("Failed to load configuration from the environment"),
    };
    init_tracing(&config.logging).context("Failed to initialise logging")?;

    let pool_size = u32::try_from(config.backup.max_concurrent_restores).unwrap_or(u32::MAX);
    let executor: Arc<dyn RestoreExecutor> =
        Arc::new(PgRestoreExecutor::new(&config.database, pool_size)?);

    match mode {
        Mode::Monitor => run_monitor(config, executor).await,
        Mode::Restore => run_restore_command(config, executor).await,
    }
}

async fn run_monitor(config: AppConfig, executor: Arc<dyn RestoreExecutor>) -> Result<i32> {
    let notifiers = Notifiers::new()
        .with(LogNotifier)
        .with(JsonStreamNotifier::stdout());
    let runner = Arc::new(JobRunner::new(&config, executor, notifiers)?);
    let monitor = DirectoryMonitor::new(&config, runner);

    let token = monitor.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Termination signal received, stopping monitor");
        token.cancel();
    });

    monitor.start().await;
    info!("Monitor has shut down.");
    Ok(exit::SUCCESS)
}

async fn run_restore_command(
    config: AppConfig,
    executor: Arc<dyn RestoreExecutor>,
) -> Result<i32> {
    let out = Arc::new(EnvelopeWriter::stdout());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let input = protocol::read_command(tokio::io::stdin(), &mut shutdown)
        .await
        .context("Failed to read command from stdin")?;
    let Some(input) = input else {
        info!("Termination signal received before a command arrived");
        return Ok(protocol::interrupted_before_command(&out));
    };
    let command = match protocol::decode(&input) {
        Ok(command) => command,
        Err(rejection) => {
            warn!("Command rejected: {} ({})", rejection.message, rejection.code);
            out.emit(rejection.envelope());
            return Ok(exit::FAILURE);
        }
    };

    let notifiers = Notifiers::new()
        .with(LogNotifier)
        .with(ProgressNotifier::new(Arc::clone(&out)));
    let runner = match JobRunner::new(&config, executor, notifiers) {
        Ok(runner) => runner,
        Err(e) => {
            out.emit(configuration_envelope(&e));
            return Err(e).context("Failed to set up the restore pipeline");
        }
    };

    Ok(protocol::execute(
        command,
        &runner,
        config.backup.archive_processed,
        &out,
        shutdown,
        config.backup.shutdown_grace,
    )
    .await)
}

fn configuration_envelope(error: &PipelineError) -> Envelope {
    let data = serde_json::json!({ "code": error.code(), "details": error.details() });
    Envelope::error(error.to_string(), data)
}

/// Logs go to stderr; stdout carries the JSON protocol in both modes.
fn init_tracing(logging: &LoggingSettings) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_level(true)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
}
