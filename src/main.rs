use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod backoff;
mod clock;
mod config;
mod error;
mod io;
mod manifest;
mod orchestrator;
mod prompts;
mod providers;

use clock::{SystemClock, TokioSleeper};
use config::RunCfg;
use error::RunError;
use io::{Materializer, SourceTag};
use orchestrator::Orchestrator;
use providers::ReplicateProvider;

/// Generates today's image, refreshes latest.jpg and meta.json, and records it in the manifest.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// YAML config file. Defaults to ./dailygen.yaml when it exists.
    #[arg(long, env = "DAILYGEN_CONFIG")]
    config: Option<PathBuf>,
    /// Default log level to debug (RUST_LOG still wins).
    #[arg(long, env = "DAILYGEN_DEBUG")]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(|| {
        let local = PathBuf::from("dailygen.yaml");
        local.exists().then_some(local)
    })
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = RunCfg::load(config_path(&cli).as_deref()).context("loading configuration")?;

    let sleeper = Arc::new(TokioSleeper);
    let provider = ReplicateProvider::from_env(cfg.provider.clone(), sleeper.clone());
    let materializer = Materializer::new(cfg.out_dir.clone(), &cfg.download, sleeper);

    let outcome = Orchestrator {
        cfg: &cfg,
        provider: &provider,
        materializer: &materializer,
        clock: &SystemClock,
    }
    .run_once()
    .await?;

    let marker = if outcome.source == SourceTag::FallbackAsset { " [FALLBACK]" } else { "" };
    let latest = cfg.latest_path();
    match outcome.key.run {
        Some(n) => info!(
            "saved {} (run #{n} for {}) and updated {}{marker}",
            outcome.path.display(),
            outcome.key.date,
            latest.display()
        ),
        None => info!("saved {} and updated {}{marker}", outcome.path.display(), latest.display()),
    }
    if let Some(reason) = &outcome.error {
        info!("fallback reason recorded in meta.json: {reason}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.downcast_ref::<RunError>().is_some_and(RunError::is_fatal) {
                error!("FATAL: no usable image for this run: {e:#}");
            } else {
                error!("FATAL: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
