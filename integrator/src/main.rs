use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use integrator::config::{
    RunContext, Settings, DEFAULT_ERASE_TOLERANCE, DEFAULT_MEDIAL_STEP, DEFAULT_SNAP_TOLERANCE,
    DEFAULT_STALE_AFTER_SECS, DEFAULT_TILE_COLUMN,
};
use integrator::error::IntegratorError;
use integrator::ledger::{JobLedger, MemoryLedger, PgLedger};
use integrator::scheduler::default_workers;
use integrator::store::TileStore;
use integrator::tiler::extract_all;
use integrator::{completed_tiles, conflate_tiles, merge_tiles, scanned_tiles};
use shared::TileStatus;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Conflate prioritized road network sources into one integrated layer"
)]
struct Cli {
    /// Directory holding source tables, caches and outputs
    #[arg(long, env = "ROADINT_WORKSPACE", default_value = ".", global = true)]
    workspace: PathBuf,

    /// Source catalog CSV (defaults to `sources.csv` in the workspace)
    #[arg(long, env = "ROADINT_CATALOG", global = true)]
    catalog: Option<PathBuf>,

    /// Tile grid GeoJSON (defaults to `grid.geojson` in the workspace)
    #[arg(long, env = "ROADINT_GRID", global = true)]
    grid: Option<PathBuf>,

    /// Postgres URL of the job ledger. Without it tiles are tracked in memory.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, env = "ROADINT_SNAP_TOLERANCE", default_value_t = DEFAULT_SNAP_TOLERANCE, global = true)]
    snap_tolerance: f64,

    #[arg(long, env = "ROADINT_ERASE_TOLERANCE", default_value_t = DEFAULT_ERASE_TOLERANCE, global = true)]
    erase_tolerance: f64,

    /// Seconds after which an in-progress claim is considered abandoned
    #[arg(long, env = "ROADINT_STALE_AFTER_SECS", default_value_t = DEFAULT_STALE_AFTER_SECS, global = true)]
    stale_after_secs: u64,

    /// Grid attribute holding the tile id
    #[arg(long, env = "ROADINT_TILE_COLUMN", default_value = DEFAULT_TILE_COLUMN, global = true)]
    tile_column: String,

    /// Cross-section spacing when deriving centerlines from road polygons
    #[arg(long, env = "ROADINT_MEDIAL_STEP", default_value_t = DEFAULT_MEDIAL_STEP, global = true)]
    medial_step: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Tile source tables into the per-source cache
    Extract {
        /// Only this source alias
        #[arg(long)]
        alias: Option<String>,
        /// Rebuild caches that already exist
        #[arg(long)]
        force: bool,
    },
    /// Conflate every tile not yet done
    Conflate {
        #[arg(long, short = 'j')]
        workers: Option<usize>,
        /// Only these tiles, comma separated
        #[arg(long, value_delimiter = ',')]
        tiles: Vec<String>,
    },
    /// Merge completed tile outputs into the integrated layer
    Merge {
        #[arg(long)]
        output: Option<PathBuf>,
        /// Append to an existing layer instead of replacing it
        #[arg(long)]
        append: bool,
    },
    /// Put every tile back to pending
    Reset,
    /// Put failed tiles back to pending
    RetryFailed,
    /// Show ledger counts and failed tiles
    Status,
}

enum Outcome {
    Complete,
    Partial,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            catalog: self.catalog.clone(),
            grid: self.grid.clone(),
            snap_tolerance: self.snap_tolerance,
            erase_tolerance: self.erase_tolerance,
            stale_after_secs: self.stale_after_secs,
            tile_column: self.tile_column.clone(),
            medial_step: self.medial_step,
            ..Settings::new(&self.workspace)
        }
    }

    async fn ledger(&self, command: &'static str) -> Result<PgLedger, IntegratorError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(IntegratorError::LedgerRequired(command))?;
        let ledger = PgLedger::connect(url, Duration::from_secs(self.stale_after_secs)).await?;
        ledger.migrate().await?;
        Ok(ledger)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "integrator=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(Outcome::Complete) => ExitCode::SUCCESS,
        Ok(Outcome::Partial) => ExitCode::from(2),
        Err(err) => {
            tracing::error!(error = %err, "integrator failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<Outcome, IntegratorError> {
    match &cli.command {
        Command::Extract { alias, force } => {
            let ctx = RunContext::load(&cli.settings())?;
            if let Some(alias) = alias {
                if ctx.catalog.get(alias).is_none() {
                    return Err(IntegratorError::UnknownSource(alias.clone()));
                }
            }
            let report = extract_all(&ctx, alias.as_deref(), *force);
            tracing::info!(
                extracted = report.extracted.len(),
                cached = report.cached.len(),
                failed = ?report.failed,
                "extraction finished"
            );
            Ok(if report.failed.is_empty() {
                Outcome::Complete
            } else {
                Outcome::Partial
            })
        }
        Command::Conflate { workers, tiles } => {
            let ctx = Arc::new(RunContext::load(&cli.settings())?);
            let workers = workers.unwrap_or_else(default_workers);
            let only = (!tiles.is_empty()).then_some(tiles.as_slice());
            let summary = if cli.database_url.is_some() {
                let ledger = Arc::new(cli.ledger("conflate").await?);
                conflate_tiles(ctx, ledger, workers, only).await?
            } else {
                tracing::warn!("no DATABASE_URL; tracking tiles in memory, an interrupted run starts over");
                let ledger = Arc::new(MemoryLedger::new(ctx.stale_after));
                conflate_tiles(ctx, ledger, workers, only).await?
            };

            if !summary.sources_skipped.is_empty() {
                tracing::warn!(sources = ?summary.sources_skipped, "sources skipped for this run");
            }
            if summary.all_done() {
                tracing::info!(tiles = summary.tiles_done, "all tiles conflated");
                Ok(Outcome::Complete)
            } else {
                tracing::warn!(
                    done = summary.tiles_done,
                    failed = summary.tiles_failed,
                    "some tiles failed; see `status` and `retry-failed`"
                );
                Ok(Outcome::Partial)
            }
        }
        Command::Merge { output, append } => {
            let ctx = RunContext::load(&cli.settings())?;
            let tiles = if cli.database_url.is_some() {
                completed_tiles(&cli.ledger("merge").await?).await?
            } else {
                scanned_tiles(&TileStore::new(ctx.workspace.tile_outputs()))?
            };
            let output = output.clone().unwrap_or_else(|| ctx.workspace.default_output());
            let report = merge_tiles(&ctx, &tiles, &output, *append)?;
            Ok(if report.skipped.is_empty() {
                Outcome::Complete
            } else {
                Outcome::Partial
            })
        }
        Command::Reset => {
            let reset = cli.ledger("reset").await?.reset_all().await?;
            tracing::info!(tiles = reset, "all tiles reset to pending");
            Ok(Outcome::Complete)
        }
        Command::RetryFailed => {
            let moved = cli.ledger("retry-failed").await?.retry_failed().await?;
            tracing::info!(tiles = moved, "failed tiles reset to pending");
            Ok(Outcome::Complete)
        }
        Command::Status => {
            let ledger = cli.ledger("status").await?;
            let summary = ledger.summary().await?;
            println!(
                "pending={} in_progress={} done={} failed={} total={}",
                summary.pending,
                summary.in_progress,
                summary.done,
                summary.failed,
                summary.total()
            );
            for job in ledger.jobs().await? {
                if job.status == TileStatus::Failed {
                    println!(
                        "{}\tattempt {}\t{}",
                        job.tile_id,
                        job.attempt,
                        job.error_message.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(if summary.failed == 0 {
                Outcome::Complete
            } else {
                Outcome::Partial
            })
        }
    }
}
