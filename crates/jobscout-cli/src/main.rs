use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use jobscout_storage::{HttpFetcher, SeenJobLedger};
use jobscout_sync::{
    load_source_registry, run_scheduled, AppConfig, LiveSourceFetch, LogNotifier,
    OpenAiCompatService, Orchestrator, RunOutcome,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobscout")]
#[command(about = "Job Scout command-line interface")]
struct Cli {
    /// Source registry file.
    #[arg(long, global = true, default_value = "sources.yaml")]
    config: PathBuf,

    /// Pass extracted records through without the normalization service.
    #[arg(long, global = true)]
    skip_normalization: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and write the results to the output directory.
    Run {
        /// Override the output directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Run the pipeline on a fixed interval, notifying on new postings.
    Schedule {
        /// Minutes between cycles.
        #[arg(long, default_value_t = 30)]
        every: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if cli.skip_normalization {
        config.skip_normalization = true;
    }

    let sources = load_source_registry(&cli.config)?;
    if sources.is_empty() {
        anyhow::bail!("no sources configured in {}", cli.config.display());
    }

    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let fetch = LiveSourceFetch::new(&fetcher);
    let service = OpenAiCompatService::new(&config)?;
    let orchestrator = Orchestrator::new(
        &fetch,
        &service,
        config.max_age_days,
        config.skip_normalization,
    );

    match cli.command.unwrap_or(Commands::Run { output_dir: None }) {
        Commands::Run { output_dir } => {
            let outcome = orchestrator.run(&sources).await;
            let output_dir = output_dir.unwrap_or_else(|| config.output_dir.clone());
            let path = write_results(&output_dir, &outcome)?;

            println!(
                "run complete: jobs={} filtered_by_date={} duplicates_removed={} errors={} output={}",
                outcome.stats.final_count,
                outcome.stats.filtered_by_date,
                outcome.stats.duplicates_removed,
                outcome.errors.len(),
                path.display()
            );
            for error in &outcome.errors {
                eprintln!("  error: {error}");
            }
        }
        Commands::Schedule { every } => {
            if let Some(parent) = config.ledger_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("creating ledger directory {}", parent.display())
                    })?;
                }
            }
            let ledger = SeenJobLedger::open(&config.ledger_path).await?;
            run_scheduled(
                &orchestrator,
                &sources,
                &ledger,
                &LogNotifier,
                Duration::from_secs(every * 60),
            )
            .await?;
        }
    }

    Ok(())
}

/// Write the filtered jobs to `jobs_<timestamp>.json` under `output_dir`.
fn write_results(output_dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let path = output_dir.join(format!("jobs_{stamp}.json"));
    let body = serde_json::to_string_pretty(&outcome.jobs).context("serializing results")?;
    std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
