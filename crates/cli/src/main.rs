//! `crawlstore-migrate`: copy the legacy SQLite cache into the remote store.
//!
//! Exit codes: `0` complete (or dry run finished), `1` failed, `2` paused by
//! Ctrl-C with the cursor saved.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use crawlstore_client::open_backends;
use crawlstore_core::migrate::CursorStore;
use crawlstore_core::{AppConfig, Codec, MigrationOptions, MigrationPhase, Migrator};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crawlstore-migrate", about = "Migrate cached crawl results from SQLite to DynamoDB")]
struct Cli {
    /// Scan and transform without writing to the remote store.
    #[arg(long)]
    dry_run: bool,

    /// Compare a sample of migrated keys across both stores when done.
    #[arg(long)]
    verify: bool,

    /// Records per batch (overrides `migration.batch_size`).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    batch_size: Option<u64>,

    /// Keys sampled for verification (overrides `migration.sample_size`).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    sample_size: Option<u64>,

    /// Count keys already present remotely as skipped.
    #[arg(long)]
    skip_existing: bool,

    /// Discard the saved cursor and start from the beginning.
    #[arg(long)]
    reset: bool,

    /// Print the saved cursor and exit.
    #[arg(long, conflicts_with_all = ["dry_run", "reset"])]
    status: bool,
}

impl Cli {
    fn options(&self, config: &AppConfig) -> MigrationOptions {
        let mut options = MigrationOptions::from_settings(&config.migration);
        options.dry_run = self.dry_run;
        options.verify = self.verify;
        options.skip_existing = self.skip_existing;
        if let Some(n) = self.batch_size {
            options.batch_size = n as usize;
        }
        if let Some(n) = self.sample_size {
            options.sample_size = n as usize;
        }
        options
    }
}

fn exit_status(phase: MigrationPhase) -> u8 {
    match phase {
        MigrationPhase::Complete => 0,
        MigrationPhase::Paused => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = AppConfig::load().context("loading configuration")?;
    let store = CursorStore::new(&config.migration.cursor_path);

    if cli.status {
        let cursor = store.load().await?;
        println!("{}", serde_json::to_string_pretty(&cursor)?);
        return Ok(ExitCode::SUCCESS);
    }

    if cli.reset {
        store.clear().await?;
        tracing::info!(path = %store.path().display(), "migration cursor cleared");
    }

    let backends = open_backends(&config).await.context("opening backends")?;
    let migrator = Migrator::new(backends.legacy, backends.remote, Codec::from_config(&config), cli.options(&config))
        .with_cursor_store(store);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; pausing after the current batch");
            on_signal.cancel();
        }
    });

    let report = migrator.run(cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.phase == MigrationPhase::Failed {
        tracing::error!(reason = report.failure_reason.as_deref().unwrap_or_default(), "migration failed");
    }
    Ok(ExitCode::from(exit_status(report.phase)))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "migration aborted");
            ExitCode::FAILURE
        }
    }
}
