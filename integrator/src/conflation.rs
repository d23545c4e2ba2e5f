//! Conflation engine: reduces the priority-ordered source layers of one
//! tile to a single deduplicated set of road lines.

use thiserror::Error;
use tracing::debug;

use crate::backend::{BackendError, GeoBackend, SpatialBackend};
use crate::config::Tolerances;
use crate::models::{RoadFeature, SourceLayer};

#[derive(Debug, Error)]
pub enum ConflationError {
    #[error("tile {tile}: snapping failed at source `{alias}`: {source}")]
    Snap {
        tile: String,
        alias: String,
        #[source]
        source: BackendError,
    },
    #[error("tile {tile}: erasing source `{alias}` failed: {source}")]
    Erase {
        tile: String,
        alias: String,
        #[source]
        source: BackendError,
    },
    #[error("tile {tile}: sources `{first}` and `{second}` share priority {priority}")]
    PriorityTie {
        tile: String,
        priority: u32,
        first: String,
        second: String,
    },
}

impl ConflationError {
    pub fn alias(&self) -> &str {
        match self {
            ConflationError::Snap { alias, .. } | ConflationError::Erase { alias, .. } => alias,
            ConflationError::PriorityTie { second, .. } => second,
        }
    }
}

/// Deduplicated result for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflatedTile {
    pub tile_id: String,
    /// Aliases of the non-empty input sources, highest priority first.
    pub contributing: Vec<String>,
    /// Kept features, grouped by source in priority order.
    pub features: Vec<RoadFeature>,
}

pub struct ConflationEngine<B = GeoBackend> {
    backend: B,
    tolerances: Tolerances,
}

impl ConflationEngine<GeoBackend> {
    pub fn with_geo_backend(tolerances: Tolerances) -> Self {
        Self::new(GeoBackend, tolerances)
    }
}

impl<B: SpatialBackend> ConflationEngine<B> {
    pub fn new(backend: B, tolerances: Tolerances) -> Self {
        Self { backend, tolerances }
    }

    pub fn tolerances(&self) -> Tolerances {
        self.tolerances
    }

    /// Conflates one tile.
    ///
    /// # Algorithm
    /// 1. Sources without features in this tile are dropped and the rest
    ///    ranked densely by priority.
    /// 2. A single remaining source is returned unchanged; none gives an
    ///    empty result.
    /// 3. Otherwise all layers are snapped together at the snap tolerance.
    /// 4. The cascade keeps the top layer whole, then appends for each lower
    ///    layer only what the erase step leaves outside everything kept so
    ///    far, at the erase tolerance.
    ///
    /// The cascade is sequential: each step erases against the kept set of
    /// the previous one.
    pub fn conflate(&self, tile_id: &str, mut layers: Vec<SourceLayer>) -> Result<ConflatedTile, ConflationError> {
        layers.sort_by_key(|layer| layer.priority);
        for pair in layers.windows(2) {
            if pair[0].priority == pair[1].priority {
                return Err(ConflationError::PriorityTie {
                    tile: tile_id.to_string(),
                    priority: pair[0].priority,
                    first: pair[0].alias.clone(),
                    second: pair[1].alias.clone(),
                });
            }
        }
        layers.retain(|layer| !layer.is_empty());
        for (rank, layer) in layers.iter().enumerate() {
            debug!(tile = tile_id, alias = %layer.alias, priority = layer.priority, rank = rank + 1, "ranked source");
        }

        let contributing: Vec<String> = layers.iter().map(|layer| layer.alias.clone()).collect();
        if layers.len() <= 1 {
            let features = layers.pop().map(|layer| layer.features).unwrap_or_default();
            return Ok(ConflatedTile {
                tile_id: tile_id.to_string(),
                contributing,
                features,
            });
        }

        let mut sets: Vec<Vec<RoadFeature>> = layers.into_iter().map(|layer| layer.features).collect();
        self.backend
            .snap(&mut sets, self.tolerances.snap)
            .map_err(|source| ConflationError::Snap {
                tile: tile_id.to_string(),
                alias: source.alias().unwrap_or(&contributing[0]).to_string(),
                source,
            })?;

        let mut sets = sets.into_iter();
        let mut kept = sets.next().unwrap_or_default();
        for (set, alias) in sets.zip(&contributing[1..]) {
            let missing = self
                .backend
                .erase(&set, &kept, self.tolerances.erase)
                .map_err(|source| ConflationError::Erase {
                    tile: tile_id.to_string(),
                    alias: alias.clone(),
                    source,
                })?;
            debug!(tile = tile_id, alias = %alias, input = set.len(), added = missing.len(), "erased against kept set");
            kept.extend(missing);
        }

        Ok(ConflatedTile {
            tile_id: tile_id.to_string(),
            contributing,
            features: kept,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::line_length;
    use geo_types::{line_string, LineString};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn road(alias: &str, name: &str, geometry: LineString<f64>) -> RoadFeature {
        RoadFeature {
            alias: alias.to_string(),
            key: name.to_string(),
            attributes: BTreeMap::from([("road_name".to_string(), json!(name))]),
            source_name: format!("WHSE.{}", alias.to_uppercase()),
            extraction_date: "2026-01-15".to_string(),
            map_tile: "082E".to_string(),
            geometry,
        }
    }

    fn engine(snap: f64, erase: f64) -> ConflationEngine {
        ConflationEngine::with_geo_backend(Tolerances::new(snap, erase).unwrap())
    }

    fn total_length(features: &[RoadFeature]) -> f64 {
        features.iter().map(|f| line_length(&f.geometry)).sum()
    }

    #[test]
    fn single_source_tile_is_unchanged() {
        let features = vec![
            road("ften", "A", line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.3)]),
            road("ften", "B", line_string![(x: 0.0, y: 1.0), (x: 10.0, y: 1.0)]),
        ];
        let layers = vec![
            SourceLayer::new("dra", 1, Vec::new()),
            SourceLayer::new("ften", 2, features.clone()),
        ];
        let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();
        assert_eq!(result.contributing, ["ften"]);
        assert_eq!(result.features, features);
    }

    #[test]
    fn empty_tile_is_not_an_error() {
        let layers = vec![SourceLayer::new("dra", 1, Vec::new())];
        let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();
        assert!(result.features.is_empty());
        assert!(result.contributing.is_empty());
    }

    #[test]
    fn near_duplicate_keeps_only_higher_priority_line() {
        let l1 = road("dra", "Main Rd", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let l2 = road("ften", "FSR 12", line_string![(x: 0.0, y: 2.0), (x: 100.0, y: 2.0)]);
        let layers = vec![
            SourceLayer::new("dra", 1, vec![l1.clone()]),
            SourceLayer::new("ften", 2, vec![l2]),
        ];
        let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();
        assert_eq!(result.features, vec![l1]);
        assert_eq!(result.contributing, ["dra", "ften"]);
    }

    #[test]
    fn distant_lines_are_both_retained() {
        let l1 = road("dra", "Main Rd", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let l2 = road("ften", "FSR 12", line_string![(x: 0.0, y: 50.0), (x: 100.0, y: 50.0)]);
        let layers = vec![
            SourceLayer::new("dra", 1, vec![l1.clone()]),
            SourceLayer::new("ften", 2, vec![l2.clone()]),
        ];
        let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();
        assert_eq!(result.features, vec![l1, l2]);
    }

    #[test]
    fn lower_source_only_adds_its_unique_extension() {
        let l1 = road("dra", "Main Rd", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let l2 = road("ften", "FSR 12", line_string![(x: 0.0, y: 1.0), (x: 100.0, y: 1.0), (x: 100.0, y: 60.0)]);
        let layers = vec![
            SourceLayer::new("dra", 1, vec![l1.clone()]),
            SourceLayer::new("ften", 2, vec![l2]),
        ];
        let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();
        assert_eq!(result.features.len(), 2);
        assert_eq!(result.features[0], l1);
        let extension = &result.features[1];
        assert_eq!(extension.alias, "ften");
        assert_eq!(extension.source_name, "WHSE.FTEN");
        assert!((line_length(&extension.geometry) - 59.99).abs() < 1e-6);
    }

    #[test]
    fn cascade_is_transitive_across_three_sources() {
        let top = road("dra", "A", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let mid = road("ften", "B", line_string![(x: 0.0, y: 3.0), (x: 100.0, y: 3.0)]);
        let low = road("og", "C", line_string![(x: 0.0, y: 1.0), (x: 100.0, y: 1.0)]);
        let layers = vec![
            SourceLayer::new("og", 3, vec![low]),
            SourceLayer::new("dra", 1, vec![top.clone()]),
            SourceLayer::new("ften", 2, vec![mid]),
        ];
        let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();
        assert_eq!(result.contributing, ["dra", "ften", "og"]);
        assert_eq!(result.features, vec![top]);
    }

    #[test]
    fn equal_priorities_are_rejected() {
        let layers = vec![
            SourceLayer::new("dra", 1, Vec::new()),
            SourceLayer::new("ften", 1, Vec::new()),
        ];
        let err = engine(5.0, 0.01).conflate("082E", layers).unwrap_err();
        assert!(matches!(err, ConflationError::PriorityTie { priority: 1, .. }));
    }

    #[test]
    fn invalid_geometry_fails_the_tile_with_alias() {
        let good = road("dra", "A", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let bad = road("ften", "B", line_string![(x: f64::NAN, y: 0.0), (x: 1.0, y: 0.0)]);
        let layers = vec![
            SourceLayer::new("dra", 1, vec![good]),
            SourceLayer::new("ften", 2, vec![bad]),
        ];
        let err = engine(5.0, 0.01).conflate("082E", layers).unwrap_err();
        assert_eq!(err.alias(), "ften");
        assert!(err.to_string().contains("082E"));
    }

    mod proptests {
        use super::*;

        /// One row of the generated tile: a top-priority segment at `y` and
        /// its lower-priority counterpart, which is a near duplicate
        /// (kind 0), a near duplicate with a unique extension (kind 1) or a
        /// line far away (kind 2). Rows are far enough apart not to interact.
        fn row(index: usize, x0: f64, len: f64, offset: f64, extra: f64, kind: u8) -> (RoadFeature, RoadFeature) {
            let y = 200.0 * index as f64;
            let top = road("dra", "t", line_string![(x: x0, y: y), (x: x0 + len, y: y)]);
            let low = match kind {
                0 => line_string![(x: x0, y: y + offset), (x: x0 + len, y: y + offset)],
                1 => line_string![(x: x0, y: y + offset), (x: x0 + len + extra, y: y + offset)],
                _ => line_string![(x: x0 + 10_000.0, y: y), (x: x0 + 10_000.0 + len, y: y)],
            };
            (top, road("ften", "l", low))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn cascade_never_adds_length_and_keeps_top_source(
                rows in prop::collection::vec(
                    (0.0..100.0f64, 10.0..80.0f64, 0.0..4.0f64, 10.0..50.0f64, 0u8..3),
                    1..6,
                ),
            ) {
                let (top, low): (Vec<_>, Vec<_>) = rows
                    .iter()
                    .enumerate()
                    .map(|(i, &(x0, len, offset, extra, kind))| row(i, x0, len, offset, extra, kind))
                    .unzip();
                let input_length = total_length(&top) + total_length(&low);
                let layers = vec![
                    SourceLayer::new("dra", 1, top.clone()),
                    SourceLayer::new("ften", 2, low),
                ];
                let result = engine(5.0, 0.01).conflate("082E", layers).unwrap();

                prop_assert!(total_length(&result.features) <= input_length + 1e-6);
                prop_assert_eq!(&result.features[..top.len()], &top[..]);
                let unique = rows.iter().filter(|r| r.4 != 0).count();
                prop_assert_eq!(result.features.len() - top.len(), unique);
                prop_assert!(result.features[top.len()..].iter().all(|f| f.alias == "ften"));
            }
        }
    }
}
