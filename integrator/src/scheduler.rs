//! Worker pool that drains the job ledger.
//!
//! Each worker loops: claim a tile, conflate it on the blocking pool, settle
//! the claim. Tiles are independent, so any number of workers (or processes
//! sharing a database ledger) can run at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use shared::RunSummary;

use crate::config::RunContext;
use crate::conflation::{ConflationEngine, ConflationError};
use crate::ledger::{Claim, JobLedger, LedgerError, LedgerSummary};
use crate::models::SourceLayer;
use crate::schema::build_tile_output;
use crate::store::{StoreError, TileStore};
use crate::tiler::{read_manifest, read_tile_features, SourceManifest, TilerError};

const CONTENTION_BACKOFF: Duration = Duration::from_millis(50);
const MAX_CONTENTION_RETRIES: u32 = 20;

#[derive(Debug, Error)]
pub enum TileError {
    #[error(transparent)]
    Source(#[from] TilerError),
    #[error(transparent)]
    Conflation(#[from] ConflationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tile worker panicked: {0}")]
    Panicked(String),
}

impl TileError {
    pub fn alias(&self) -> Option<&str> {
        match self {
            TileError::Source(err) => Some(err.alias()),
            TileError::Conflation(err) => Some(err.alias()),
            TileError::Store(_) | TileError::Panicked(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedTile {
    pub tile_id: String,
    pub reference: String,
    pub rows: usize,
    pub contributing: Vec<String>,
}

/// Default worker count: one per core, leaving one for the ledger and I/O.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Runs the whole per-tile unit of work: read, conflate, write.
pub struct TileProcessor {
    ctx: Arc<RunContext>,
    engine: ConflationEngine,
    store: TileStore,
    manifests: Mutex<HashMap<String, Option<Arc<SourceManifest>>>>,
}

impl TileProcessor {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        let store = TileStore::new(ctx.workspace.tile_outputs());
        Self {
            engine: ConflationEngine::with_geo_backend(ctx.tolerances),
            store,
            manifests: Mutex::new(HashMap::new()),
            ctx,
        }
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    /// Manifest of an extracted source, loaded once. A source that was never
    /// extracted, or whose manifest is unreadable, is absent for the run.
    fn manifest(&self, alias: &str) -> Option<Arc<SourceManifest>> {
        let mut manifests = self.manifests.lock().unwrap_or_else(PoisonError::into_inner);
        manifests
            .entry(alias.to_string())
            .or_insert_with(|| match read_manifest(&self.ctx.workspace, alias) {
                Ok(Some(manifest)) => Some(Arc::new(manifest)),
                Ok(None) => {
                    warn!(alias, "source has no tiled cache; treated as absent");
                    None
                }
                Err(err) => {
                    warn!(alias, error = %err, "source cache unreadable; treated as absent");
                    None
                }
            })
            .clone()
    }

    /// Sources that were looked up and found missing, sorted.
    pub fn skipped_sources(&self) -> Vec<String> {
        let manifests = self.manifests.lock().unwrap_or_else(PoisonError::into_inner);
        let mut skipped: Vec<String> = manifests
            .iter()
            .filter(|(_, manifest)| manifest.is_none())
            .map(|(alias, _)| alias.clone())
            .collect();
        skipped.sort();
        skipped
    }

    pub fn process(&self, tile_id: &str) -> Result<ProcessedTile, TileError> {
        if self.store.discard(tile_id)? {
            debug!(tile = tile_id, "discarded output of an earlier attempt");
        }

        let mut layers = Vec::new();
        for source in self.ctx.catalog.conflated() {
            let Some(priority) = source.priority else { continue };
            let Some(manifest) = self.manifest(&source.alias) else { continue };
            let features = read_tile_features(&self.ctx.workspace, &manifest, tile_id)?;
            layers.push(SourceLayer::new(source.alias.clone(), priority, features));
        }

        let conflated = self.engine.conflate(tile_id, layers)?;
        let output = build_tile_output(&self.ctx.catalog, &conflated);
        let reference = self.store.write(&output)?;
        Ok(ProcessedTile {
            tile_id: tile_id.to_string(),
            reference,
            rows: output.rows.len(),
            contributing: conflated.contributing,
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    done: AtomicUsize,
    failed: AtomicUsize,
}

pub struct Scheduler<L> {
    ledger: Arc<L>,
    processor: Arc<TileProcessor>,
    workers: usize,
    scope: Option<Arc<[String]>>,
}

impl<L: JobLedger + 'static> Scheduler<L> {
    pub fn new(ledger: Arc<L>, processor: Arc<TileProcessor>, workers: usize) -> Self {
        Self {
            ledger,
            processor,
            workers: workers.max(1),
            scope: None,
        }
    }

    /// Only claims (and reports on) `tile_ids`; other ledger rows are left alone.
    pub fn with_scope(mut self, tile_ids: Vec<String>) -> Self {
        self.scope = Some(tile_ids.into());
        self
    }

    /// Runs workers until no tile can be claimed. Tile failures are recorded
    /// in the ledger; only ledger errors end the run early.
    pub async fn run(&self) -> Result<RunSummary, LedgerError> {
        let counters = Arc::new(Counters::default());
        let mut set = JoinSet::new();
        for worker in 0..self.workers {
            set.spawn(worker_loop(
                worker,
                Arc::clone(&self.ledger),
                Arc::clone(&self.processor),
                Arc::clone(&counters),
                self.scope.clone(),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "worker stopped on a ledger error");
                    first_error.get_or_insert(err);
                }
                Err(err) => error!(error = %err, "worker task aborted"),
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let summary = match &self.scope {
            None => self.ledger.summary().await?,
            Some(scope) => {
                let jobs = self.ledger.jobs().await?;
                LedgerSummary::of_jobs(jobs.iter().filter(|job| scope.contains(&job.tile_id)))
            }
        };
        info!(
            processed = counters.done.load(Ordering::Relaxed),
            failed_here = counters.failed.load(Ordering::Relaxed),
            done = summary.done,
            failed = summary.failed,
            "conflation pass finished"
        );
        Ok(RunSummary {
            tiles_done: summary.done as usize,
            tiles_failed: summary.failed as usize,
            sources_skipped: self.processor.skipped_sources(),
        })
    }
}

async fn claim_with_retry<L: JobLedger>(
    ledger: &L,
    scope: Option<&[String]>,
) -> Result<Option<Claim>, LedgerError> {
    let mut retries = 0;
    loop {
        let claimed = match scope {
            Some(tile_ids) => ledger.claim_next_in(tile_ids).await,
            None => ledger.claim_next().await,
        };
        match claimed {
            Err(err) if err.is_contention() && retries < MAX_CONTENTION_RETRIES => {
                retries += 1;
                debug!(retries, "claim contention, retrying");
                tokio::time::sleep(CONTENTION_BACKOFF).await;
            }
            other => return other,
        }
    }
}

async fn settle<L: JobLedger>(
    ledger: &L,
    claim: &Claim,
    outcome: &Result<ProcessedTile, TileError>,
) -> Result<bool, LedgerError> {
    let mut retries = 0;
    loop {
        let settled = match outcome {
            Ok(done) => ledger.complete(claim, &done.reference).await,
            Err(err) => ledger.fail(claim, &err.to_string()).await,
        };
        match settled {
            Err(err) if err.is_contention() && retries < MAX_CONTENTION_RETRIES => {
                retries += 1;
                tokio::time::sleep(CONTENTION_BACKOFF).await;
            }
            other => return other,
        }
    }
}

async fn worker_loop<L: JobLedger>(
    worker: usize,
    ledger: Arc<L>,
    processor: Arc<TileProcessor>,
    counters: Arc<Counters>,
    scope: Option<Arc<[String]>>,
) -> Result<(), LedgerError> {
    while let Some(claim) = claim_with_retry(ledger.as_ref(), scope.as_deref()).await? {
        debug!(worker, tile = %claim.tile_id, attempt = claim.attempt, "claimed tile");
        let tile_id = claim.tile_id.clone();
        let task_processor = Arc::clone(&processor);
        let outcome = tokio::task::spawn_blocking(move || task_processor.process(&tile_id))
            .await
            .unwrap_or_else(|err| Err(TileError::Panicked(err.to_string())));

        match &outcome {
            Ok(done) => {
                counters.done.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker,
                    tile = %done.tile_id,
                    rows = done.rows,
                    sources = done.contributing.len(),
                    "tile done"
                );
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker,
                    tile = %claim.tile_id,
                    alias = err.alias().unwrap_or("-"),
                    error = %err,
                    "tile failed"
                );
            }
        }

        settle(ledger.as_ref(), &claim, &outcome).await?;
    }
    debug!(worker, "no more tiles to claim");
    Ok(())
}
