use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::grid::GridError;
use crate::ledger::LedgerError;
use crate::merger::MergeError;
use crate::store::StoreError;
use crate::tiler::TilerError;

/// Run-level failures. Any of these stops the command.
#[derive(Debug, Error)]
pub enum IntegratorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid source catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("invalid tile grid: {0}")]
    Grid(#[from] GridError),
    #[error(transparent)]
    Tiler(#[from] TilerError),
    #[error("job ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("`{0}` needs the job ledger database; set DATABASE_URL")]
    LedgerRequired(&'static str),
    #[error("{0} tiles are still pending or in progress")]
    Unfinished(u64),
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("unknown tile `{0}`")]
    UnknownTile(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
