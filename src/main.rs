// ANS Consolidation - pipeline CLI
//
// ans-pipeline <stage>: runs one stage, or `run` for all of them in order.

use anyhow::{Context, Result};
use ans_consolidation::logging::init_tracing;
use ans_consolidation::{Pipeline, PipelineConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ans-pipeline")]
#[command(about = "Consolidate ANS operator registries and quarterly statements", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Path and size settings; flags win over the ANS_* variables.
#[derive(Args)]
struct PathArgs {
    /// Staging dir for downloaded files
    #[arg(long, global = true, env = "ANS_RAW_DIR")]
    raw_dir: Option<PathBuf>,

    /// Output dir for generated tables and archives
    #[arg(long, global = true, env = "ANS_FINAL_DIR")]
    final_dir: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true, env = "ANS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Number of recent quarters to fetch
    #[arg(long, global = true, env = "ANS_QUARTERS")]
    quarters: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download statements and registries into the raw dir
    Fetch,

    /// Parse statements into the per-quarter expense table
    Process,

    /// Join expenses with the registry; write flat file and archive
    Consolidate,

    /// Compute summary statistics and the per-operator aggregate file
    Aggregate,

    /// Load registry and consolidated table into SQLite
    Load,

    /// All stages in order
    Run,

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(dir) = cli.paths.raw_dir {
        config.raw_dir = dir;
    }
    if let Some(dir) = cli.paths.final_dir {
        config.final_dir = dir;
    }
    if let Some(path) = cli.paths.db_path {
        config.db_path = path;
    }
    if let Some(q) = cli.paths.quarters.filter(|q| *q > 0) {
        config.quarters = q;
    }

    let pipeline = Pipeline::new(config);

    match cli.command {
        Commands::Fetch => run_fetch(&pipeline)?,
        Commands::Process => {
            let report = pipeline.process().context("process stage failed")?;
            println!(
                "✓ {} expense records from {} statements → {}",
                report.records,
                report.periods.len(),
                report.output.display()
            );
            for warning in &report.skipped_files {
                println!("⚠️  {}", warning.summary());
            }
        }
        Commands::Consolidate => {
            let stage = pipeline.consolidate().context("consolidate stage failed")?;
            println!(
                "✓ {} rows ({} unmatched, {} rejected) → {}",
                stage.output.rows,
                stage.report.unmatched_rows,
                stage.report.rejected_rows,
                stage.output.archive.display()
            );
            for warning in &stage.report.warnings {
                println!("⚠️  {}", warning.summary());
            }
            println!("✓ {}", stage.quality.summary());
        }
        Commands::Aggregate => {
            let summary = pipeline.aggregate().context("aggregate stage failed")?;
            println!(
                "✓ total {:.2}, mean {:.2} over {} records",
                summary.total_expenses, summary.mean_expense, summary.record_count
            );
        }
        Commands::Load => {
            let run = pipeline.load().context("load stage failed")?;
            println!(
                "✓ {} operators, {} expenses loaded (run {})",
                run.operators, run.expenses, run.run_id
            );
        }
        Commands::Run => {
            let summary = pipeline.run_all().context("pipeline run failed")?;
            println!(
                "🎉 run {} complete: {} rows consolidated, {} loaded",
                summary.run_id, summary.consolidate.output.rows, summary.load.expenses
            );
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&pipeline.config)?);
        }
    }

    Ok(())
}

#[cfg(feature = "fetch")]
fn run_fetch(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.fetch().context("fetch stage failed")?;
    println!(
        "✓ {} downloaded, {} already present, {} failed",
        report.downloaded,
        report.skipped_existing,
        report.failed_sources.len()
    );
    Ok(())
}

#[cfg(not(feature = "fetch"))]
fn run_fetch(_pipeline: &Pipeline) -> Result<()> {
    anyhow::bail!("fetch stage not available: rebuild with --features fetch")
}
