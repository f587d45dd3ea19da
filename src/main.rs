// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use romdl::format::{format_eta, format_rate, format_size};
use romdl::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "romdl")]
#[command(about = "Download ROM batches with a bounded number of parallel transfers")]
struct Cli {
    /// Settings and history database
    #[arg(long, global = true, default_value = "romdl.db")]
    db: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one batch from a JSON list of jobs
    Download {
        /// File holding `[{"name", "url", "group_key", "expected_size_bytes"}, ...]`
        jobs: PathBuf,
        #[command(flatten)]
        overrides: SettingsArgs,
    },
    /// List completed downloads
    History {
        /// Forget every recorded download
        #[arg(long)]
        clear: bool,
    },
    /// Show the stored settings, or update them when options are given
    Settings {
        #[command(flatten)]
        overrides: SettingsArgs,
    },
}

#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// Parallel downloads (1-10)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Root folder; files land in <root>/<group_key>/
    #[arg(long)]
    download_root: Option<PathBuf>,

    /// Combined cap in bytes per second, 0 for unlimited
    #[arg(long)]
    speed_limit: Option<u64>,
}

impl SettingsArgs {
    /// Applies the given options, returning whether anything changed.
    fn apply(&self, settings: &mut Settings) -> bool {
        let before = settings.clone();
        if let Some(max_concurrent) = self.max_concurrent {
            settings.set_max_concurrent(max_concurrent);
        }
        if let Some(root) = &self.download_root {
            settings.set_download_root(root);
        }
        if let Some(limit) = self.speed_limit {
            settings.set_speed_limit(limit);
        }
        *settings != before
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let store = StateStore::open(&cli.db)
        .await
        .with_context(|| format!("opening database {}", cli.db.display()))?;
    let mut settings = store.load_settings().await?.unwrap_or_default();

    match cli.command {
        Command::Download { jobs, overrides } => {
            overrides.apply(&mut settings);
            run_batch(&store, settings, &jobs).await
        }
        Command::History { clear } => {
            if clear {
                let removed = store.clear_history().await?;
                println!("Removed {removed} entries.");
                return Ok(());
            }
            for entry in store.completed_downloads().await? {
                println!("{:<12} {:<40} {}", entry.group_key, entry.name, entry.local_path.display());
            }
            Ok(())
        }
        Command::Settings { overrides } => {
            if overrides.apply(&mut settings) {
                store.save_settings(&settings).await?;
                info!("settings saved");
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run_batch(store: &StateStore, settings: Settings, jobs_path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(jobs_path)
        .await
        .with_context(|| format!("reading {}", jobs_path.display()))?;
    let jobs: Vec<DownloadJob> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing job list {}", jobs_path.display()))?;

    let fetcher = Arc::new(HttpFetcher::new(&settings)?);
    let (manager, events) = DownloadManager::new(jobs, Arc::new(settings), fetcher);
    let mut manager = manager.with_queue_callback(|waiting| {
        info!(waiting = waiting.len(), "queue changed");
    });

    let cancel = manager.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling downloads");
            cancel.cancel_all();
        }
    });

    let printer = tokio::spawn(print_events(events));
    let report = manager.process_queue().await?;
    drop(manager);
    let _ = printer.await;

    for completed in &report.completed {
        store
            .record_completed(&CompletedDownload::from_job(completed))
            .await?;
    }

    println!(
        "{} completed, {} failed, {} not started{}",
        report.completed.len(),
        report.failed.len(),
        report.dropped.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for name in &report.failed {
        println!("  failed: {name}");
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ManagerEvent::JobProgress(progress) => println!(
                "[{:>3}%] {} {}/{} {} eta {}",
                progress.percent(),
                progress.name,
                format_size(progress.downloaded_bytes),
                format_size(progress.total_bytes),
                format_rate(progress.speed_bytes_per_sec),
                format_eta(progress.eta_seconds),
            ),
            ManagerEvent::AggregateProgress(percent) => println!("[batch {percent:>3}%]"),
            ManagerEvent::FileFinished {
                name,
                local_file: Some(path),
                ..
            } => println!("done: {name} -> {}", path.display()),
            ManagerEvent::FileFinished {
                name,
                local_file: None,
                ..
            } => println!("not downloaded: {name}"),
            ManagerEvent::AllFinished => break,
            ManagerEvent::Log(_) | ManagerEvent::JobFinished { .. } => {}
        }
    }
}
