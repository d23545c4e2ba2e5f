//! Polygon-to-line preprocessing for road polygon sources.
//!
//! Runs in two passes. Pass 1 repairs and explodes every polygon into a
//! fully materialised list; pass 2 derives medial lines from that list.
//! Tiling only starts once pass 1 has finished for the whole table.

use geo::Area;
use geo_types::{Coord, Geometry, LineString, Polygon};

use crate::geometry::{dedup_coords, distance, is_finite};

/// Result of the repair pass.
#[derive(Debug, Default)]
pub struct RepairedPolygons {
    pub polygons: Vec<Polygon<f64>>,
    /// Parts (or rings) that could not be turned into a valid polygon.
    pub dropped: usize,
}

fn repair_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords = dedup_coords(ring.coords().copied().filter(|c| is_finite(*c)));
    if coords.first() != coords.last() {
        if let Some(&first) = coords.first() {
            coords.push(first);
        }
    }
    if coords.len() < 4 {
        return None;
    }
    let ring = LineString::new(coords);
    let area = Polygon::new(ring.clone(), Vec::new()).unsigned_area();
    (area > 0.0).then_some(ring)
}

fn repair_polygon(polygon: &Polygon<f64>, dropped: &mut usize) -> Option<Polygon<f64>> {
    let Some(exterior) = repair_ring(polygon.exterior()) else {
        *dropped += 1;
        return None;
    };
    let mut holes = Vec::with_capacity(polygon.interiors().len());
    for interior in polygon.interiors() {
        match repair_ring(interior) {
            Some(ring) => holes.push(ring),
            None => *dropped += 1,
        }
    }
    Some(Polygon::new(exterior, holes))
}

/// Pass 1: repair rings and explode multi-part polygons into single parts.
/// Non-polygon geometries are counted as dropped; collections are searched
/// for polygon members.
pub fn repair_and_explode<'a>(geometries: impl IntoIterator<Item = &'a Geometry<f64>>) -> RepairedPolygons {
    let mut out = RepairedPolygons::default();
    for geometry in geometries {
        collect_polygons(geometry, &mut out);
    }
    out
}

fn collect_polygons(geometry: &Geometry<f64>, out: &mut RepairedPolygons) {
    match geometry {
        Geometry::Polygon(polygon) => {
            if let Some(polygon) = repair_polygon(polygon, &mut out.dropped) {
                out.polygons.push(polygon);
            }
        }
        Geometry::MultiPolygon(parts) => {
            for part in parts {
                if let Some(polygon) = repair_polygon(part, &mut out.dropped) {
                    out.polygons.push(polygon);
                }
            }
        }
        Geometry::GeometryCollection(members) => {
            for member in members {
                collect_polygons(member, out);
            }
        }
        _ => out.dropped += 1,
    }
}

/// Principal axis of a ring's vertices: centroid, unit axis and unit normal.
fn principal_axis(coords: &[Coord<f64>]) -> (Coord<f64>, Coord<f64>, Coord<f64>) {
    let n = coords.len() as f64;
    let cx = coords.iter().map(|c| c.x).sum::<f64>() / n;
    let cy = coords.iter().map(|c| c.y).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for c in coords {
        let (dx, dy) = (c.x - cx, c.y - cy);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    let axis = Coord {
        x: theta.cos(),
        y: theta.sin(),
    };
    let normal = Coord { x: -axis.y, y: axis.x };
    (Coord { x: cx, y: cy }, axis, normal)
}

fn dot(a: Coord<f64>, b: Coord<f64>) -> f64 {
    a.x * b.x + a.y * b.y
}

/// Offsets along `normal` where the cross-section line at station `s`
/// crosses the polygon boundary, sorted.
fn cross_section(polygon: &Polygon<f64>, origin: Coord<f64>, axis: Coord<f64>, normal: Coord<f64>, s: f64) -> Vec<f64> {
    let mut hits = Vec::new();
    for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
        for edge in ring.lines() {
            let sa = dot(edge.start - origin, axis) - s;
            let sb = dot(edge.end - origin, axis) - s;
            if (sa < 0.0) == (sb < 0.0) {
                continue;
            }
            let t = sa / (sa - sb);
            let wa = dot(edge.start - origin, normal);
            let wb = dot(edge.end - origin, normal);
            hits.push(wa + t * (wb - wa));
        }
    }
    hits.sort_by(f64::total_cmp);
    hits
}

/// Pass 2: medial line of a single road polygon.
///
/// # Algorithm
/// Cross-sections perpendicular to the polygon's principal axis are taken
/// every `step` units. The midpoint of the widest inside interval of each
/// cross-section becomes a vertex. Consecutive midpoints further apart than
/// three steps start a new line, which happens where the polygon branches.
///
/// # Returns
/// Zero or more lines, each with at least two distinct vertices.
pub fn medial_lines(polygon: &Polygon<f64>, step: f64) -> Vec<LineString<f64>> {
    let ring: Vec<Coord<f64>> = polygon.exterior().coords().copied().collect();
    if ring.len() < 4 || !(step > 0.0) {
        return Vec::new();
    }
    let (origin, axis, normal) = principal_axis(&ring[..ring.len() - 1]);
    let (s_min, s_max) = ring
        .iter()
        .map(|c| dot(*c - origin, axis))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| (lo.min(s), hi.max(s)));
    let length = s_max - s_min;
    if !(length > 0.0) {
        return Vec::new();
    }

    let stations = ((length / step).ceil() as usize).max(1);
    let inset = length * 1e-6;
    let mut lines = Vec::new();
    let mut current: Vec<Coord<f64>> = Vec::new();

    for k in 0..=stations {
        let s = (s_min + length * k as f64 / stations as f64).clamp(s_min + inset, s_max - inset);
        let hits = cross_section(polygon, origin, axis, normal, s);
        let widest = hits
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .max_by(|a, b| (a.1 - a.0).total_cmp(&(b.1 - b.0)));
        let Some((w0, w1)) = widest else {
            continue;
        };
        let w = (w0 + w1) / 2.0;
        let point = Coord {
            x: origin.x + axis.x * s + normal.x * w,
            y: origin.y + axis.y * s + normal.y * w,
        };
        if let Some(&last) = current.last() {
            if distance(last, point) > 3.0 * step.max(length / stations as f64) {
                flush(&mut current, &mut lines);
            }
        }
        current.push(point);
    }
    flush(&mut current, &mut lines);
    lines
}

fn flush(current: &mut Vec<Coord<f64>>, lines: &mut Vec<LineString<f64>>) {
    let coords = dedup_coords(current.drain(..));
    if coords.len() >= 2 {
        lines.push(LineString::new(coords));
    }
}
