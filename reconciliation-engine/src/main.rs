//! Reconciliation Engine entry point.

use anyhow::Context;
use clap::Parser;
use reconciliation_engine::config::ReconciliationConfig;
use reconciliation_engine::services::get_metrics;
use reconciliation_engine::startup::{write_report, Application, RunOptions};
use service_core::observability::init_tracing;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "reconciliation-engine",
    version,
    about = "Reconcile bank statements against book records"
)]
struct Cli {
    /// Bank statement file (CSV or JSON)
    #[arg(long, env = "RECON_BANK_FILE")]
    bank: PathBuf,

    /// Book records file (CSV or JSON)
    #[arg(long, env = "RECON_BOOK_FILE")]
    book: PathBuf,

    /// Where to write the JSON report (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Classify with rules only; never call the oracle
    #[arg(long)]
    deterministic_only: bool,

    /// Append raw oracle responses to this file (JSON lines)
    #[arg(long, env = "RECON_RESPONSE_LOG")]
    response_log: Option<PathBuf>,

    /// Print Prometheus metrics to stderr when done
    #[arg(long)]
    metrics: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received, emitting partial report");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = ReconciliationConfig::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.log_json,
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bank = %cli.bank.display(),
        book = %cli.book.display(),
        "Starting reconciliation-engine"
    );

    let app = Application::build(
        config,
        RunOptions {
            deterministic_only: cli.deterministic_only,
            response_log: cli.response_log.clone(),
        },
    )
    .context("Failed to build application")?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = app.run(&cli.bank, &cli.book, cancel).await;
    signal_task.abort();

    let report = result.context("Reconciliation failed")?;
    write_report(&report, cli.output.as_deref()).context("Failed to write report")?;

    if cli.metrics {
        eprint!("{}", get_metrics());
    }

    if report.partial {
        tracing::warn!(
            unprocessed = report.summary.unprocessed,
            "Report is partial: the run was cancelled"
        );
    }
    tracing::info!("Reconciliation complete");
    Ok(())
}
