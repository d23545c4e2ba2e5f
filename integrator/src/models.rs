use std::collections::BTreeMap;

use geo_types::LineString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single road line owned by one source, restricted to one tile.
///
/// `source_name` and `extraction_date` are stamped once at extraction and
/// carried unchanged through snapping, erasing and merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadFeature {
    pub alias: String,
    /// Primary key values joined with `|`, used to identify the feature in logs.
    pub key: String,
    /// Declared fields (lowercase) to their source values.
    pub attributes: BTreeMap<String, Value>,
    pub source_name: String,
    pub extraction_date: String,
    pub map_tile: String,
    pub geometry: LineString<f64>,
}

impl RoadFeature {
    pub fn with_geometry(&self, geometry: LineString<f64>) -> Self {
        Self {
            geometry,
            ..self.clone()
        }
    }
}

/// Features of one source inside one tile, tagged with its catalog priority.
#[derive(Debug, Clone)]
pub struct SourceLayer {
    pub alias: String,
    pub priority: u32,
    pub features: Vec<RoadFeature>,
}

impl SourceLayer {
    pub fn new(alias: impl Into<String>, priority: u32, features: Vec<RoadFeature>) -> Self {
        Self {
            alias: alias.into(),
            priority,
            features,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
