use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gharvest_adapters::ReadmeCleaner;
use gharvest_storage::write_json_atomic;
use gharvest_sync::{
    build_service, clean_dataset, load_enriched_dataset, merge_datasets, HarvestConfig,
    HarvestPipeline, RunStatus, RunSummary,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gharvest")]
#[command(about = "Resumable GitHub repository harvester")]
struct Cli {
    /// Serve requests from an offline fixture bundle instead of GitHub.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect pending tasks, then enrich (default).
    Run,
    Collect,
    Enrich {
        #[arg(long)]
        limit: Option<usize>,
    },
    Status,
    /// Union two enriched dataset files.
    Merge {
        a: PathBuf,
        b: PathBuf,
        #[arg(long, default_value = "output/merged_repositories.json")]
        output: PathBuf,
    },
    /// Clean readmes of a dataset file and attach combined text.
    Clean { input: PathBuf, output: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gharvest_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = pipeline(config, cli.fixture.as_deref())?;
            report(&pipeline.run_once().await?);
        }
        Commands::Collect => {
            let pipeline = pipeline(config, cli.fixture.as_deref())?;
            report(&pipeline.collect().await?);
        }
        Commands::Enrich { limit } => {
            let pipeline = pipeline(config, cli.fixture.as_deref())?;
            report(&pipeline.enrich(limit).await?);
        }
        Commands::Status => {
            let pipeline = pipeline(config, cli.fixture.as_deref())?;
            let status = pipeline.status().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("serializing status")?
            );
        }
        Commands::Merge { a, b, output } => {
            let left = load_enriched_dataset(&a).await?;
            let right = load_enriched_dataset(&b).await?;
            let (left_len, right_len) = (left.repositories.len(), right.repositories.len());
            let merged = merge_datasets(left, right);
            write_json_atomic(&output, &merged).await?;
            println!(
                "merged {left_len} + {right_len} -> {} repositories into {}",
                merged.metadata.total_repos,
                output.display()
            );
        }
        Commands::Clean { input, output } => {
            let dataset = load_enriched_dataset(&input).await?;
            let cleaned = clean_dataset(dataset, &ReadmeCleaner::default());
            let with_readme = cleaned
                .repositories
                .iter()
                .filter(|r| !r.readme.is_empty())
                .count();
            write_json_atomic(&output, &cleaned).await?;
            println!(
                "cleaned {} repositories ({with_readme} with meaningful readmes) into {}",
                cleaned.repositories.len(),
                output.display()
            );
        }
    }

    Ok(())
}

fn pipeline(config: HarvestConfig, fixture: Option<&Path>) -> Result<HarvestPipeline> {
    let service = build_service(&config, fixture)?;
    Ok(HarvestPipeline::new(config, service))
}

fn report(summary: &RunSummary) {
    match &summary.status {
        RunStatus::Completed => println!(
            "harvest complete: run_id={} phase={} repositories={} filtered={} pending_tasks={} output={}",
            summary.run_id,
            summary.phase,
            summary.repositories,
            summary.filtered_count,
            summary.tasks_pending.len(),
            summary.output_dir
        ),
        RunStatus::Incomplete { failures } => println!(
            "harvest incomplete: run_id={} phase={} repositories={} failures={failures}; rerun to retry them",
            summary.run_id, summary.phase, summary.repositories
        ),
        RunStatus::QuotaExhausted { reset_at } => {
            let reset = reset_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "the next rate-limit window".to_string());
            println!(
                "rate limit exhausted: run_id={} phase={} repositories={}; resume after {reset}",
                summary.run_id, summary.phase, summary.repositories
            );
        }
    }
    if let Some(enrichment) = &summary.enrichment {
        println!(
            "enrichment: enriched={} partial={} failed={} remaining={}",
            enrichment.enriched, enrichment.partial, enrichment.failed, enrichment.remaining
        );
    }
}
