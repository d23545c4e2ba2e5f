//! Planar geometry helpers shared by the tiler and the spatial backend.
//!
//! All coordinates are assumed to be in a projected CRS whose unit is the
//! unit of the configured tolerances (metres for BC Albers).

use geo::{BooleanOps, BoundingRect, Closest, ClosestPoint, EuclideanDistance, EuclideanLength, Intersects, LineLocatePoint};
use geo_types::{Coord, Geometry, Line, LineString, MultiLineString, Point, Polygon, Rect};
use rstar::AABB;
use shared::Position;

/// Parametric distance below which two split points are treated as one.
pub const PARAM_EPSILON: f64 = 1e-12;

pub fn is_finite(coord: Coord<f64>) -> bool {
    coord.x.is_finite() && coord.y.is_finite()
}

pub fn distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Point::from(a).euclidean_distance(&Point::from(b))
}

/// Closest point to `p` on `segment`. A zero-length segment yields its start.
pub fn closest_on_segment(p: Coord<f64>, segment: Line<f64>) -> Coord<f64> {
    match segment.closest_point(&Point::from(p)) {
        Closest::Intersection(q) | Closest::SinglePoint(q) => q.0,
        Closest::Indeterminate => segment.start,
    }
}

/// Fraction of `segment` at which the point closest to `p` lies, in `[0, 1]`.
pub fn segment_param(p: Coord<f64>, segment: Line<f64>) -> f64 {
    segment.line_locate_point(&Point::from(p)).unwrap_or(0.0)
}

pub fn point_segment_distance(p: Coord<f64>, segment: Line<f64>) -> f64 {
    Point::from(p).euclidean_distance(&segment)
}

pub fn lerp(a: Coord<f64>, b: Coord<f64>, t: f64) -> Coord<f64> {
    Coord {
        x: a.x + (b.x - a.x) * t,
        y: a.y + (b.y - a.y) * t,
    }
}

/// Envelope of a segment grown by `pad` on every side.
pub fn segment_envelope(a: Coord<f64>, b: Coord<f64>, pad: f64) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [a.x.min(b.x) - pad, a.y.min(b.y) - pad],
        [a.x.max(b.x) + pad, a.y.max(b.y) + pad],
    )
}

pub fn rect_envelope(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// Drops consecutive duplicate vertices.
pub fn dedup_coords(coords: impl IntoIterator<Item = Coord<f64>>) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = coords.into_iter().collect();
    out.dedup();
    out
}

/// Line through the finite vertices of `coords`, or `None` when fewer than
/// two distinct ones remain.
pub fn clean_line(coords: impl IntoIterator<Item = Coord<f64>>) -> Option<LineString<f64>> {
    let coords = dedup_coords(coords.into_iter().filter(|c| is_finite(*c)));
    (coords.len() >= 2).then(|| LineString::new(coords))
}

/// Every usable line in `geometry`, with multi-part and collection
/// geometries exploded. Non-linear members contribute nothing.
pub fn lines_of(geometry: &Geometry<f64>) -> Vec<LineString<f64>> {
    match geometry {
        Geometry::Line(line) => clean_line([line.start, line.end]).into_iter().collect(),
        Geometry::LineString(line) => clean_line(line.0.iter().copied()).into_iter().collect(),
        Geometry::MultiLineString(lines) => lines
            .iter()
            .filter_map(|line| clean_line(line.0.iter().copied()))
            .collect(),
        Geometry::GeometryCollection(members) => members.iter().flat_map(lines_of).collect(),
        _ => Vec::new(),
    }
}

pub fn positions_from_line(line: &LineString<f64>) -> Vec<Position> {
    line.coords().map(|c| vec![c.x, c.y]).collect()
}

pub fn line_length(line: &LineString<f64>) -> f64 {
    line.euclidean_length()
}

/// Clips `line` to `polygon`, returning the pieces lying inside it.
pub fn clip_line_to_polygon(line: &LineString<f64>, polygon: &Polygon<f64>) -> Vec<LineString<f64>> {
    let (Some(line_bounds), Some(poly_bounds)) = (line.bounding_rect(), polygon.bounding_rect()) else {
        return Vec::new();
    };
    if !line_bounds.intersects(&poly_bounds) {
        return Vec::new();
    }
    polygon
        .clip(&MultiLineString::new(vec![line.clone()]), false)
        .into_iter()
        .filter_map(|piece| clean_line(piece.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{coord, line_string, point, polygon, GeometryCollection};

    fn square(min: f64, max: f64) -> Polygon<f64> {
        polygon![
            (x: min, y: min),
            (x: max, y: min),
            (x: max, y: max),
            (x: min, y: max),
            (x: min, y: min),
        ]
    }

    #[test]
    fn closest_point_clamps_to_segment_ends() {
        let segment = Line::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 10.0, y: 0.0 });
        let p = coord! { x: -5.0, y: 3.0 };
        assert_eq!(closest_on_segment(p, segment), segment.start);
        assert_eq!(segment_param(p, segment), 0.0);
        assert_eq!(segment_param(coord! { x: 2.5, y: 1.0 }, segment), 0.25);
        assert!((point_segment_distance(coord! { x: 5.0, y: 3.0 }, segment) - 3.0).abs() < 1e-12);

        let point = Line::new(segment.start, segment.start);
        assert_eq!(closest_on_segment(p, point), segment.start);
    }

    #[test]
    fn clean_line_drops_degenerate_input() {
        assert!(clean_line([coord! { x: 1.0, y: 1.0 }, coord! { x: 1.0, y: 1.0 }]).is_none());
        assert!(clean_line([coord! { x: 1.0, y: f64::NAN }, coord! { x: 2.0, y: 2.0 }]).is_none());
        let line = clean_line([coord! { x: 0.0, y: 0.0 }, coord! { x: 3.0, y: 4.0 }]).unwrap();
        assert_eq!(line_length(&line), 5.0);
    }

    #[test]
    fn lines_of_explodes_collections_and_skips_other_kinds() {
        let collection = Geometry::GeometryCollection(GeometryCollection(vec![
            Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)]),
            Geometry::Point(point!(x: 5.0, y: 5.0)),
            Geometry::MultiLineString(MultiLineString::new(vec![
                line_string![(x: 0.0, y: 1.0), (x: 10.0, y: 1.0)],
                line_string![(x: 3.0, y: 3.0), (x: 3.0, y: 3.0)],
            ])),
        ]));
        assert_eq!(lines_of(&collection).len(), 2);
        assert!(lines_of(&Geometry::Polygon(square(0.0, 1.0))).is_empty());
    }

    #[test]
    fn clip_keeps_only_inside_part() {
        let line = line_string![(x: -10.0, y: 5.0), (x: 20.0, y: 5.0)];
        let pieces = clip_line_to_polygon(&line, &square(0.0, 10.0));
        assert_eq!(pieces.len(), 1);
        assert!((line_length(&pieces[0]) - 10.0).abs() < 1e-9);
        assert!(pieces[0].coords().all(|c| (c.y - 5.0).abs() < 1e-9 && c.x > -1e-9 && c.x < 10.0 + 1e-9));
    }

    #[test]
    fn clip_splits_line_leaving_and_reentering() {
        let line = line_string![
            (x: 2.0, y: 2.0),
            (x: 2.0, y: 20.0),
            (x: 8.0, y: 20.0),
            (x: 8.0, y: 2.0),
        ];
        let pieces = clip_line_to_polygon(&line, &square(0.0, 10.0));
        assert_eq!(pieces.len(), 2);
        assert!((line_length(&pieces[0]) - 8.0).abs() < 1e-9);
        assert!((line_length(&pieces[1]) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn clip_outside_is_empty() {
        let line = line_string![(x: 20.0, y: 20.0), (x: 30.0, y: 30.0)];
        assert!(clip_line_to_polygon(&line, &square(0.0, 10.0)).is_empty());
    }
}
