//! RDS point-in-time restore tool
//!
//! Replaces a restored copy of a database instance with a fresh one restored
//! from ten minutes ago, then reconfigures and reboots it.

// rds-pitr-restore/src/main.rs
mod config;
mod errors;
mod rds;
mod restore;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use config::ParamArgs;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rds-pitr-restore")]
#[command(about = "Restore an RDS instance to ten minutes ago under a fixed target name", long_about = None)]
struct Cli {
    /// Optional JSON config file; flags and environment variables override it
    #[arg(long, env = "RDS_RESTORE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    params: ParamArgs,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout is reserved for the report.
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let params = config::resolve_params(cli.config.as_deref(), &cli.params)
        .context("Failed to resolve restore parameters")?;
    info!(?params, "Resolved restore parameters");
    if params.master_password.is_none() {
        warn!("No master password given; the restored instance keeps the source's credentials");
    }

    let control_plane =
        rds::client::RdsControlPlane::connect(&params.region, params.endpoint_url.as_deref()).await;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current call");
            on_signal.cancel();
        }
    });

    let report = restore::run_restore_flow(&params, &control_plane, cancel)
        .await
        .context("Restore workflow failed")?;

    let failed = report.failed_stages();
    if !failed.is_empty() {
        warn!(?failed, "Restore finished, but some best-effort stages failed");
    }

    if cli.json {
        let rendered =
            serde_json::to_string_pretty(&report).context("Failed to serialize run report")?;
        println!("{}", rendered);
    } else {
        print!("{}", report.render_summary());
    }
    Ok(())
}
