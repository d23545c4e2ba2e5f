//! Spatial backend: the snap and erase primitives the conflation engine is
//! built on. The engine only talks to the [`SpatialBackend`] trait; the
//! default [`GeoBackend`] is a planar implementation on `geo` types with a
//! kd-tree over vertices and an R-tree over segments.

use geo_types::{Coord, Line, LineString};
use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use thiserror::Error;
use tracing::debug;

use crate::geometry::{
    closest_on_segment, dedup_coords, distance, is_finite, lerp, line_length, point_segment_distance,
    segment_envelope, segment_param, PARAM_EPSILON,
};
use crate::models::RoadFeature;

/// Below this distance two vertices are the same vertex.
const COINCIDENT: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("feature `{key}` of source `{alias}` has invalid geometry: {reason}")]
    InvalidGeometry {
        alias: String,
        key: String,
        reason: &'static str,
    },
    #[error("spatial index query failed: {0}")]
    Index(String),
}

impl BackendError {
    pub fn alias(&self) -> Option<&str> {
        match self {
            BackendError::InvalidGeometry { alias, .. } => Some(alias),
            BackendError::Index(_) => None,
        }
    }
}

impl From<kdtree::ErrorKind> for BackendError {
    fn from(err: kdtree::ErrorKind) -> Self {
        BackendError::Index(format!("{err:?}"))
    }
}

pub trait SpatialBackend: Send + Sync {
    /// Moves vertices and edges of lower-priority layers onto higher-priority
    /// geometry within `tolerance`. `layers[0]` has the highest priority and
    /// is never modified. Each layer snaps against everything above it after
    /// that geometry was itself snapped. Features that collapse to a single
    /// point are removed.
    fn snap(&self, layers: &mut [Vec<RoadFeature>], tolerance: f64) -> Result<(), BackendError>;

    /// Parts of `input` lying further than `tolerance` from every feature of
    /// `eraser`. Remaining parts no longer than `tolerance` are discarded.
    fn erase(
        &self,
        input: &[RoadFeature],
        eraser: &[RoadFeature],
        tolerance: f64,
    ) -> Result<Vec<RoadFeature>, BackendError>;
}

fn validate(feature: &RoadFeature) -> Result<(), BackendError> {
    let invalid = |reason| BackendError::InvalidGeometry {
        alias: feature.alias.clone(),
        key: feature.key.clone(),
        reason,
    };
    let coords = &feature.geometry.0;
    if coords.len() < 2 {
        return Err(invalid("fewer than two vertices"));
    }
    if !coords.iter().all(|c| is_finite(*c)) {
        return Err(invalid("non-finite coordinate"));
    }
    if coords.iter().all(|c| *c == coords[0]) {
        return Err(invalid("zero length"));
    }
    Ok(())
}

type SegmentEntry = GeomWithData<Rectangle<[f64; 2]>, (Coord<f64>, Coord<f64>)>;

fn segment_entry(a: Coord<f64>, b: Coord<f64>) -> SegmentEntry {
    GeomWithData::new(Rectangle::from_aabb(segment_envelope(a, b, 0.0)), (a, b))
}

/// Accumulated higher-priority geometry for the snap pass.
struct SnapIndex {
    vertices: KdTree<f64, Coord<f64>, [f64; 2]>,
    segments: RTree<SegmentEntry>,
    tolerance: f64,
}

impl SnapIndex {
    fn new(tolerance: f64) -> Self {
        Self {
            vertices: KdTree::new(2),
            segments: RTree::new(),
            tolerance,
        }
    }

    fn add(&mut self, line: &LineString<f64>) -> Result<(), BackendError> {
        for coord in line.coords() {
            self.vertices.add([coord.x, coord.y], *coord)?;
        }
        for segment in line.lines() {
            if segment.start != segment.end {
                self.segments.insert(segment_entry(segment.start, segment.end));
            }
        }
        Ok(())
    }

    fn nearest_vertex(&self, p: Coord<f64>) -> Result<Option<Coord<f64>>, BackendError> {
        let found = self.vertices.nearest(&[p.x, p.y], 1, &squared_euclidean)?;
        Ok(found
            .first()
            .filter(|(dist_sq, _)| *dist_sq <= self.tolerance * self.tolerance)
            .map(|(_, vertex)| **vertex))
    }

    fn nearest_on_segment(&self, p: Coord<f64>) -> Option<Coord<f64>> {
        let search = AABB::from_corners(
            [p.x - self.tolerance, p.y - self.tolerance],
            [p.x + self.tolerance, p.y + self.tolerance],
        );
        self.segments
            .locate_in_envelope_intersecting(&search)
            .map(|entry| closest_on_segment(p, Line::new(entry.data.0, entry.data.1)))
            .map(|q| (distance(p, q), q))
            .filter(|(d, _)| *d <= self.tolerance)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, q)| q)
    }

    /// Higher-priority vertices within tolerance of segment `a`-`b`, ordered
    /// along it, excluding the segment's own ends.
    fn vertices_along(&self, a: Coord<f64>, b: Coord<f64>) -> Result<Vec<Coord<f64>>, BackendError> {
        let segment = Line::new(a, b);
        let centre = lerp(a, b, 0.5);
        let radius = distance(a, b) / 2.0 + self.tolerance;
        let mut found: Vec<(f64, Coord<f64>)> = self
            .vertices
            .within(&[centre.x, centre.y], radius * radius, &squared_euclidean)?
            .into_iter()
            .map(|(_, vertex)| *vertex)
            .filter(|v| distance(*v, a) > COINCIDENT && distance(*v, b) > COINCIDENT)
            .filter(|v| point_segment_distance(*v, segment) <= self.tolerance)
            .map(|v| (segment_param(v, segment), v))
            .collect();
        found.sort_by(|x, y| x.0.total_cmp(&y.0));
        Ok(found.into_iter().map(|(_, v)| v).collect())
    }

    /// Vertex snapping first (nearest vertex, else nearest edge point), then
    /// edge snapping by threading nearby higher-priority vertices into each
    /// segment. `None` when the line collapses to a point.
    fn snap_line(&self, line: &LineString<f64>) -> Result<Option<LineString<f64>>, BackendError> {
        let mut moved = Vec::with_capacity(line.0.len());
        for &p in &line.0 {
            let target = match self.nearest_vertex(p)? {
                Some(vertex) => vertex,
                None => self.nearest_on_segment(p).unwrap_or(p),
            };
            moved.push(target);
        }
        let moved = dedup_coords(moved);
        if moved.len() < 2 {
            return Ok(None);
        }

        let mut threaded = vec![moved[0]];
        for pair in moved.windows(2) {
            threaded.extend(self.vertices_along(pair[0], pair[1])?);
            threaded.push(pair[1]);
        }
        let threaded = dedup_coords(threaded);
        Ok((threaded.len() >= 2).then(|| LineString::new(threaded)))
    }
}

/// Sub-interval of segment `a`-`b` (as parameters) lying within `tolerance`
/// of segment `c`-`d`.
///
/// Distance from a point moving linearly along `a`-`b` to a segment is
/// convex in the parameter, so a ternary search finds the closest approach
/// and bisection finds where the distance crosses `tolerance` on each side.
fn covered_interval(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>, d: Coord<f64>, tolerance: f64) -> Option<(f64, f64)> {
    let eraser = Line::new(c, d);
    let dist = |t: f64| point_segment_distance(lerp(a, b, t), eraser);

    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    while hi - lo > 1e-12 {
        let m1 = lo + (hi - lo) / 3.0;
        let m2 = hi - (hi - lo) / 3.0;
        if dist(m1) <= dist(m2) {
            hi = m2;
        } else {
            lo = m1;
        }
    }
    let closest = (lo + hi) / 2.0;
    if dist(closest) > tolerance {
        return None;
    }

    let boundary = |mut outside: f64, mut inside: f64| {
        for _ in 0..60 {
            let mid = (outside + inside) / 2.0;
            if dist(mid) <= tolerance {
                inside = mid;
            } else {
                outside = mid;
            }
        }
        inside
    };
    let start = if dist(0.0) <= tolerance { 0.0 } else { boundary(0.0, closest) };
    let end = if dist(1.0) <= tolerance { 1.0 } else { boundary(1.0, closest) };
    Some((start, end))
}

fn uncovered_pieces(line: &LineString<f64>, index: &RTree<SegmentEntry>, tolerance: f64) -> Vec<LineString<f64>> {
    let mut pieces = Vec::new();
    let mut current: Vec<Coord<f64>> = Vec::new();
    let mut flush = |current: &mut Vec<Coord<f64>>| {
        let coords = dedup_coords(current.drain(..));
        if coords.len() >= 2 {
            pieces.push(LineString::new(coords));
        }
    };

    for segment in line.lines() {
        let (a, b) = (segment.start, segment.end);
        if a == b {
            continue;
        }
        let at = |t: f64| {
            if t <= 0.0 {
                a
            } else if t >= 1.0 {
                b
            } else {
                lerp(a, b, t)
            }
        };

        let mut covered: Vec<(f64, f64)> = index
            .locate_in_envelope_intersecting(&segment_envelope(a, b, tolerance))
            .filter_map(|entry| covered_interval(a, b, entry.data.0, entry.data.1, tolerance))
            .collect();
        covered.sort_by(|x, y| x.0.total_cmp(&y.0));

        let mut free = Vec::new();
        let mut cursor = 0.0_f64;
        for (start, end) in covered {
            if start > cursor + PARAM_EPSILON {
                free.push((cursor, start));
            }
            cursor = cursor.max(end);
        }
        if cursor < 1.0 - PARAM_EPSILON {
            free.push((cursor, 1.0));
        }

        for &(start, end) in &free {
            let from = at(start);
            if start > 0.0 || current.last() != Some(&from) {
                flush(&mut current);
                current.push(from);
            }
            current.push(at(end));
        }
        if free.last().map_or(true, |&(_, end)| end < 1.0) {
            flush(&mut current);
        }
    }
    flush(&mut current);
    pieces
}

/// Planar backend on `geo` types.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoBackend;

impl SpatialBackend for GeoBackend {
    fn snap(&self, layers: &mut [Vec<RoadFeature>], tolerance: f64) -> Result<(), BackendError> {
        for feature in layers.iter().flatten() {
            validate(feature)?;
        }

        let mut index = SnapIndex::new(tolerance);
        for (rank, layer) in layers.iter_mut().enumerate() {
            if rank > 0 {
                let mut kept = Vec::with_capacity(layer.len());
                for mut feature in layer.drain(..) {
                    match index.snap_line(&feature.geometry)? {
                        Some(line) => {
                            feature.geometry = line;
                            kept.push(feature);
                        }
                        None => debug!(
                            alias = %feature.alias,
                            key = %feature.key,
                            "feature collapsed onto higher-priority geometry"
                        ),
                    }
                }
                *layer = kept;
            }
            for feature in layer.iter() {
                index.add(&feature.geometry)?;
            }
        }
        Ok(())
    }

    fn erase(
        &self,
        input: &[RoadFeature],
        eraser: &[RoadFeature],
        tolerance: f64,
    ) -> Result<Vec<RoadFeature>, BackendError> {
        for feature in input.iter().chain(eraser) {
            validate(feature)?;
        }
        let index = RTree::bulk_load(
            eraser
                .iter()
                .flat_map(|feature| feature.geometry.lines())
                .filter(|segment| segment.start != segment.end)
                .map(|segment| segment_entry(segment.start, segment.end))
                .collect(),
        );

        let mut remaining = Vec::new();
        for feature in input {
            for piece in uncovered_pieces(&feature.geometry, &index, tolerance) {
                if line_length(&piece) > tolerance {
                    remaining.push(feature.with_geometry(piece));
                }
            }
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::line_string;
    use std::collections::BTreeMap;

    fn road(alias: &str, key: &str, geometry: LineString<f64>) -> RoadFeature {
        RoadFeature {
            alias: alias.to_string(),
            key: key.to_string(),
            attributes: BTreeMap::new(),
            source_name: alias.to_string(),
            extraction_date: "2026-01-15".to_string(),
            map_tile: "082E".to_string(),
            geometry,
        }
    }

    #[test]
    fn snap_moves_near_vertices_and_keeps_top_layer() {
        let top = road("dra", "1", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let low = road("ften", "2", line_string![(x: 0.0, y: 2.0), (x: 100.0, y: 3.0)]);
        let mut layers = vec![vec![top.clone()], vec![low]];
        GeoBackend.snap(&mut layers, 5.0).unwrap();
        assert_eq!(layers[0][0], top);
        assert_eq!(layers[1][0].geometry, top.geometry);
    }

    #[test]
    fn snap_threads_higher_vertices_into_long_edges() {
        let top = road("dra", "1", line_string![(x: 40.0, y: 0.0), (x: 60.0, y: 0.0)]);
        let low = road("ften", "2", line_string![(x: 0.0, y: 1.0), (x: 100.0, y: 1.0)]);
        let mut layers = vec![vec![top], vec![low]];
        GeoBackend.snap(&mut layers, 5.0).unwrap();
        assert_eq!(
            layers[1][0].geometry,
            line_string![(x: 0.0, y: 1.0), (x: 40.0, y: 0.0), (x: 60.0, y: 0.0), (x: 100.0, y: 1.0)]
        );
    }

    #[test]
    fn snap_leaves_distant_geometry_alone() {
        let top = road("dra", "1", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let low = road("ften", "2", line_string![(x: 0.0, y: 50.0), (x: 100.0, y: 50.0)]);
        let mut layers = vec![vec![top], vec![low.clone()]];
        GeoBackend.snap(&mut layers, 5.0).unwrap();
        assert_eq!(layers[1][0], low);
    }

    #[test]
    fn snap_drops_features_collapsing_to_a_point() {
        let top = road("dra", "1", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let stub = road("ften", "2", line_string![(x: 0.0, y: 1.0), (x: 1.0, y: 1.0)]);
        let mut layers = vec![vec![top], vec![stub]];
        GeoBackend.snap(&mut layers, 5.0).unwrap();
        assert!(layers[1].is_empty());
    }

    #[test]
    fn erase_removes_coincident_part_and_keeps_the_rest() {
        let kept = road("dra", "1", line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0)]);
        let input = road("ften", "2", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]);
        let out = GeoBackend.erase(&[input], &[kept], 0.01).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, "2");
        let start = out[0].geometry.0[0];
        assert!((start.x - 50.01).abs() < 1e-6);
        assert_eq!(out[0].geometry.0[1], Coord { x: 100.0, y: 0.0 });
    }

    #[test]
    fn erase_splits_line_around_crossing_eraser() {
        let kept = road("dra", "1", line_string![(x: 50.0, y: -10.0), (x: 50.0, y: 10.0)]);
        let input = road(
            "ften",
            "2",
            line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0), (x: 100.0, y: 0.0)],
        );
        let out = GeoBackend.erase(&[input], &[kept], 0.01).unwrap();
        assert_eq!(out.len(), 2);
        assert!((line_length(&out[0].geometry) - 49.99).abs() < 1e-6);
        assert!((line_length(&out[1].geometry) - 49.99).abs() < 1e-6);
    }

    #[test]
    fn erase_keeps_chained_segments_as_one_piece() {
        let kept = road("dra", "1", line_string![(x: 0.0, y: 50.0), (x: 10.0, y: 50.0)]);
        let input = road(
            "ften",
            "2",
            line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 20.0, y: 5.0)],
        );
        let out = GeoBackend.erase(&[input.clone()], &[kept], 0.01).unwrap();
        assert_eq!(out, vec![input]);
    }

    #[test]
    fn invalid_geometry_names_the_source() {
        let bad = road("ften", "9", line_string![(x: 1.0, y: 1.0), (x: 1.0, y: 1.0)]);
        let good = road("dra", "1", line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)]);
        let err = GeoBackend.erase(&[bad], &[good], 0.01).unwrap_err();
        assert_eq!(err.alias(), Some("ften"));
        assert!(err.to_string().contains("zero length"));
    }
}
