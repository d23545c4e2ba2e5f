//! Run configuration: validated tolerances, the workspace directory layout
//! and the [`RunContext`] handed to every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::catalog::Catalog;
use crate::error::IntegratorError;
use crate::grid::TileGrid;

pub const DEFAULT_SNAP_TOLERANCE: f64 = 7.0;
pub const DEFAULT_ERASE_TOLERANCE: f64 = 0.01;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 3600;
pub const DEFAULT_TILE_COLUMN: &str = "map_tile";
pub const DEFAULT_MEDIAL_STEP: f64 = 10.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} tolerance must be a finite positive number, got {value}")]
    InvalidTolerance { name: &'static str, value: f64 },
    #[error("erase tolerance {erase} must be smaller than snap tolerance {snap}")]
    ToleranceOrder { snap: f64, erase: f64 },
    #[error("medial step must be a finite positive number, got {0}")]
    InvalidMedialStep(f64),
    #[error("tile column must not be empty")]
    EmptyTileColumn,
}

/// Snap and erase distances, in CRS units.
///
/// `erase` is always strictly smaller than `snap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub snap: f64,
    pub erase: f64,
}

impl Tolerances {
    pub fn new(snap: f64, erase: f64) -> Result<Self, ConfigError> {
        for (name, value) in [("snap", snap), ("erase", erase)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidTolerance { name, value });
            }
        }
        if erase >= snap {
            return Err(ConfigError::ToleranceOrder { snap, erase });
        }
        Ok(Self { snap, erase })
    }
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            snap: DEFAULT_SNAP_TOLERANCE,
            erase: DEFAULT_ERASE_TOLERANCE,
        }
    }
}

/// Options for the extraction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOptions {
    /// Attribute naming the tile of pre-tiled (`none`) sources.
    pub tile_column: String,
    /// Cross-section spacing used when deriving medial lines.
    pub medial_step: f64,
}

impl ExtractOptions {
    pub fn new(tile_column: impl Into<String>, medial_step: f64) -> Result<Self, ConfigError> {
        let tile_column = tile_column.into().trim().to_lowercase();
        if tile_column.is_empty() {
            return Err(ConfigError::EmptyTileColumn);
        }
        if !medial_step.is_finite() || medial_step <= 0.0 {
            return Err(ConfigError::InvalidMedialStep(medial_step));
        }
        Ok(Self {
            tile_column,
            medial_step,
        })
    }
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            tile_column: DEFAULT_TILE_COLUMN.to_string(),
            medial_step: DEFAULT_MEDIAL_STEP,
        }
    }
}

/// Directory layout of one integration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_catalog(&self) -> PathBuf {
        self.root.join("sources.csv")
    }

    pub fn default_grid(&self) -> PathBuf {
        self.root.join("grid.geojson")
    }

    /// Input table for a source.
    pub fn source_table(&self, alias: &str) -> PathBuf {
        self.root.join("sources").join(format!("{alias}.geojson"))
    }

    pub fn tiled_dir(&self, alias: &str) -> PathBuf {
        self.root.join("tiled").join(alias)
    }

    pub fn tile_outputs(&self) -> PathBuf {
        self.root.join("tiles")
    }

    pub fn default_output(&self) -> PathBuf {
        self.root.join(format!("{}.ndjson", shared::MERGED_LAYER_NAME))
    }
}

/// Raw settings as collected from the command line and environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workspace: PathBuf,
    pub catalog: Option<PathBuf>,
    pub grid: Option<PathBuf>,
    pub snap_tolerance: f64,
    pub erase_tolerance: f64,
    pub stale_after_secs: u64,
    pub tile_column: String,
    pub medial_step: f64,
}

impl Settings {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            catalog: None,
            grid: None,
            snap_tolerance: DEFAULT_SNAP_TOLERANCE,
            erase_tolerance: DEFAULT_ERASE_TOLERANCE,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            tile_column: DEFAULT_TILE_COLUMN.to_string(),
            medial_step: DEFAULT_MEDIAL_STEP,
        }
    }
}

/// Everything a component needs to know about the current run.
#[derive(Debug)]
pub struct RunContext {
    pub workspace: Workspace,
    pub catalog: Catalog,
    pub grid: TileGrid,
    pub tolerances: Tolerances,
    pub extract: ExtractOptions,
    pub stale_after: Duration,
}

impl RunContext {
    /// Validates settings and loads the catalog and grid. Any failure here is
    /// fatal and happens before a single tile is touched.
    pub fn load(settings: &Settings) -> Result<Self, IntegratorError> {
        let tolerances = Tolerances::new(settings.snap_tolerance, settings.erase_tolerance)?;
        let extract = ExtractOptions::new(&settings.tile_column, settings.medial_step)?;
        let workspace = Workspace::new(&settings.workspace);

        let catalog_path = settings
            .catalog
            .clone()
            .unwrap_or_else(|| workspace.default_catalog());
        let catalog = Catalog::from_path(&catalog_path)?;

        let grid_path = settings.grid.clone().unwrap_or_else(|| workspace.default_grid());
        let grid = TileGrid::from_path(&grid_path, &extract.tile_column)?;

        tracing::info!(
            sources = catalog.conflated().count(),
            tiles = grid.len(),
            snap = tolerances.snap,
            erase = tolerances.erase,
            "loaded run configuration"
        );

        Ok(Self {
            workspace,
            catalog,
            grid,
            tolerances,
            extract,
            stale_after: Duration::from_secs(settings.stale_after_secs),
        })
    }
}
