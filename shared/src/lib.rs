use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source tables, the grid and the merged layer all use GeoJSON positions.
pub use geojson::Position;

/// Column holding the provenance table name stamped at extraction.
pub const SOURCE_NAME_COLUMN: &str = "SOURCE_NAME";
/// Column holding the ISO date the source was extracted.
pub const EXTRACTION_DATE_COLUMN: &str = "EXTRACTION_DATE";
/// Column holding the grid tile a row was produced in.
pub const MAP_TILE_COLUMN: &str = "MAP_TILE";

/// Columns every tile output and the merged layer start with, in order.
pub const PROVENANCE_COLUMNS: [&str; 3] = [SOURCE_NAME_COLUMN, EXTRACTION_DATE_COLUMN, MAP_TILE_COLUMN];

/// Name of the merged layer written in the output header.
pub const MERGED_LAYER_NAME: &str = "integrated_roads";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TileStatus::Pending => "pending",
            TileStatus::InProgress => "in_progress",
            TileStatus::Done => "done",
            TileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tile status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for TileStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TileStatus::Pending),
            "in_progress" => Ok(TileStatus::InProgress),
            "done" => Ok(TileStatus::Done),
            "failed" => Ok(TileStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One conflated row inside a tile output. `values` is aligned with the
/// owning [`TileOutput::columns`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRow {
    pub values: Vec<Value>,
    pub geometry: Vec<Position>,
}

/// Self-contained result of conflating one tile. The column list is the
/// tile's working schema: provenance columns followed by the attribute
/// columns of every source that had data in the tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileOutput {
    pub tile_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<TileRow>,
}

/// First line of the merged output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerHeader {
    pub layer: String,
    pub columns: Vec<String>,
}

/// Outcome of a conflation run, reported to the operator on exit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tiles_done: usize,
    pub tiles_failed: usize,
    pub sources_skipped: Vec<String>,
}

impl RunSummary {
    pub fn all_done(&self) -> bool {
        self.tiles_failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TileStatus::Pending,
            TileStatus::InProgress,
            TileStatus::Done,
            TileStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TileStatus>(), Ok(status));
        }
        assert!("running".parse::<TileStatus>().is_err());
    }
}
