mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use permitflow_sync::{
    run_sync_once, Backends, PipelineSettings, RunSummary, SourceRegistry, SyncConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "permitflow")]
#[command(about = "Incremental building-permit ingestion")]
struct Cli {
    /// Source registry; overrides PERMITFLOW_SOURCES.
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once.
    Sync {
        /// Run only this source, even if it is disabled.
        #[arg(long)]
        source: Option<String>,
        /// Fetch and normalize without writing permits or watermarks.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on PERMITFLOW_SYNC_CRON until interrupted.
    Schedule,
    /// Print the stored watermark of every source.
    State,
    /// Check the source registry and environment without fetching.
    Validate,
}

/// Cancelled on Ctrl-C; in-flight sources stop without advancing.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling in-flight sources");
            trigger.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.sources {
        println!("{}", report.summary_line());
    }
    println!(
        "run {} finished: sources={} failed={}",
        summary.run_id,
        summary.sources.len(),
        summary.failed_count()
    );
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    logging::init()?;
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env().context("reading PERMITFLOW_* environment")?;
    if let Some(path) = cli.sources {
        config.sources_path = path;
    }
    let registry = SourceRegistry::load(&config.sources_path).await?;

    match cli.command.unwrap_or(Commands::Sync {
        source: None,
        dry_run: false,
    }) {
        Commands::Sync { source, dry_run } => {
            let cancel = shutdown_token();
            let summary =
                run_sync_once(&config, registry, source.as_deref(), dry_run, &cancel).await?;

            print_summary(&summary);
            Ok(if summary.has_failures() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Schedule => {
            let backends = Backends::connect(&config).await?;
            let pipeline = backends.pipeline(registry.sources, PipelineSettings::from(&config));
            let cancel = shutdown_token();
            let Some(mut sched) = pipeline
                .maybe_build_scheduler(config.scheduler_enabled, &config.sync_cron, cancel.clone())
                .await?
            else {
                bail!("scheduler disabled; set PERMITFLOW_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");

            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
            backends.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::State => {
            let backends = Backends::dry_run(&config).await?;
            let marks = backends.state.list().await.context("listing watermarks")?;
            for source in &registry.sources {
                match marks.iter().find(|m| m.source_id == source.id) {
                    Some(mark) => println!(
                        "{} last_run={} status={} records={}{}",
                        source.id,
                        mark.last_run.to_rfc3339(),
                        mark.last_status.as_str(),
                        mark.records_processed,
                        mark.error_message
                            .as_deref()
                            .map(|e| format!(" error=\"{e}\""))
                            .unwrap_or_default()
                    ),
                    None => println!("{} never run", source.id),
                }
            }
            for orphan in marks
                .iter()
                .filter(|m| registry.get(&m.source_id).is_none())
            {
                println!("{} (not in registry) last_run={}", orphan.source_id, orphan.last_run.to_rfc3339());
            }
            backends.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            for source in &registry.sources {
                println!(
                    "{} kind={} enabled={} page_size={} rate_limit={}/s endpoint={}",
                    source.id,
                    source.kind,
                    source.enabled,
                    source.page_size(),
                    source.rate_limit,
                    source.endpoint
                );
            }
            println!(
                "{} source(s) valid; state={:?} sink={:?} chunk_size={}",
                registry.sources.len(),
                config.state_backend,
                config.sink_backend,
                config.chunk_size
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
