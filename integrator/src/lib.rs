pub mod backend;
pub mod catalog;
pub mod config;
pub mod conflation;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod ledger;
pub mod merger;
pub mod models;
pub mod preprocess;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod tiler;

use std::path::Path;
use std::sync::Arc;

use shared::RunSummary;

use crate::config::RunContext;
use crate::error::IntegratorError;
use crate::ledger::JobLedger;
use crate::merger::{CompletedTile, MergeReport, Merger};
use crate::scheduler::{Scheduler, TileProcessor};
use crate::store::TileStore;

/// Registers grid tiles with the ledger and drains them with `workers`
/// concurrent workers. With `only`, just those tiles are registered and
/// claimed; every id must name a grid tile.
pub async fn conflate_tiles<L: JobLedger + 'static>(
    ctx: Arc<RunContext>,
    ledger: Arc<L>,
    workers: usize,
    only: Option<&[String]>,
) -> Result<RunSummary, IntegratorError> {
    let selected = match only {
        Some(ids) => {
            if let Some(unknown) = ids.iter().find(|id| ctx.grid.get(id).is_none()) {
                return Err(IntegratorError::UnknownTile(unknown.clone()));
            }
            let mut ids = ids.to_vec();
            ids.sort();
            ids.dedup();
            Some(ids)
        }
        None => None,
    };

    let tile_ids = selected.clone().unwrap_or_else(|| ctx.grid.ids());
    let added = ledger.register(&tile_ids).await?;
    tracing::info!(added, tiles = tile_ids.len(), workers, "registered tiles");

    let processor = Arc::new(TileProcessor::new(Arc::clone(&ctx)));
    let mut scheduler = Scheduler::new(ledger, processor, workers);
    if let Some(ids) = selected {
        scheduler = scheduler.with_scope(ids);
    }
    Ok(scheduler.run().await?)
}

/// Completed tiles recorded by the ledger. Refuses while any tile is still
/// pending or in progress.
pub async fn completed_tiles<L: JobLedger>(ledger: &L) -> Result<Vec<CompletedTile>, IntegratorError> {
    let summary = ledger.summary().await?;
    if summary.unfinished() > 0 {
        return Err(IntegratorError::Unfinished(summary.unfinished()));
    }
    Ok(ledger
        .done_jobs()
        .await?
        .into_iter()
        .filter_map(CompletedTile::from_job)
        .collect())
}

/// Completed tiles found in the output store, for runs without a ledger
/// database.
pub fn scanned_tiles(store: &TileStore) -> Result<Vec<CompletedTile>, IntegratorError> {
    Ok(store
        .scan()?
        .into_iter()
        .map(|(tile_id, output_reference)| CompletedTile {
            tile_id,
            output_reference,
        })
        .collect())
}

/// Merges `tiles` into the layer at `output`. Without `append` any existing
/// layer is replaced.
pub fn merge_tiles(
    ctx: &RunContext,
    tiles: &[CompletedTile],
    output: &Path,
    append: bool,
) -> Result<MergeReport, IntegratorError> {
    if !append {
        match std::fs::remove_file(output) {
            Ok(()) => tracing::info!(path = %output.display(), "replacing existing merged layer"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    let store = TileStore::new(ctx.workspace.tile_outputs());
    let report = Merger::new(&store, ctx.catalog.union_columns()).merge(tiles, output)?;
    Ok(report)
}
