//! Fixed tile grid with an R-tree over tile bounds.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use geo::BoundingRect;
use geo_types::{Geometry, Polygon, Rect};
use geojson::FeatureCollection;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use thiserror::Error;

use crate::catalog::lookup;
use crate::geometry::{is_finite, rect_envelope};

#[derive(Debug, Error)]
pub enum GridError {
    #[error("cannot read tile grid {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tile grid {path} is not a feature collection: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("grid feature {index} has no `{column}` attribute")]
    MissingId { index: usize, column: String },
    #[error("tile `{0}` is not a single valid polygon")]
    InvalidTile(String),
    #[error("tile `{0}` appears more than once")]
    DuplicateTile(String),
    #[error("tile grid is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: String,
    pub polygon: Polygon<f64>,
    pub bounds: Rect<f64>,
}

impl Tile {
    pub fn new(id: impl Into<String>, polygon: Polygon<f64>) -> Option<Self> {
        let bounds = polygon.bounding_rect()?;
        Some(Self {
            id: id.into(),
            polygon,
            bounds,
        })
    }
}

type TileEntry = GeomWithData<Rectangle<[f64; 2]>, usize>;

#[derive(Debug)]
pub struct TileGrid {
    tiles: Vec<Tile>,
    index: RTree<TileEntry>,
    by_id: HashMap<String, usize>,
}

/// A tile must be one polygon with finite, non-degenerate rings.
fn tile_polygon(geometry: Geometry<f64>) -> Option<Polygon<f64>> {
    let polygon = match geometry {
        Geometry::Polygon(polygon) => polygon,
        Geometry::MultiPolygon(parts) if parts.0.len() == 1 => parts.0.into_iter().next()?,
        _ => return None,
    };
    let valid = std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .all(|ring| ring.0.len() >= 4 && ring.coords().all(|c| is_finite(*c)));
    valid.then_some(polygon)
}

impl TileGrid {
    pub fn from_path(path: &Path, id_column: &str) -> Result<Self, GridError> {
        let file = File::open(path).map_err(|source| GridError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let collection: FeatureCollection =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| GridError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_collection(&collection, id_column)
    }

    /// Reads tiles from polygon features; the tile id is the `id_column`
    /// attribute rendered as a string.
    pub fn from_collection(collection: &FeatureCollection, id_column: &str) -> Result<Self, GridError> {
        let mut tiles = Vec::with_capacity(collection.features.len());
        for (index, feature) in collection.features.iter().enumerate() {
            let id = match feature.properties.as_ref().and_then(|properties| lookup(properties, id_column)) {
                Some(serde_json::Value::String(id)) => id.trim().to_string(),
                Some(serde_json::Value::Number(id)) => id.to_string(),
                _ => {
                    return Err(GridError::MissingId {
                        index,
                        column: id_column.to_string(),
                    })
                }
            };
            let tile = feature
                .geometry
                .as_ref()
                .and_then(|geometry| Geometry::try_from(&geometry.value).ok())
                .and_then(tile_polygon)
                .and_then(|polygon| Tile::new(id.clone(), polygon))
                .ok_or_else(|| GridError::InvalidTile(id))?;
            tiles.push(tile);
        }
        Self::new(tiles)
    }

    pub fn new(tiles: Vec<Tile>) -> Result<Self, GridError> {
        if tiles.is_empty() {
            return Err(GridError::Empty);
        }
        let mut by_id = HashMap::with_capacity(tiles.len());
        for (idx, tile) in tiles.iter().enumerate() {
            if by_id.insert(tile.id.clone(), idx).is_some() {
                return Err(GridError::DuplicateTile(tile.id.clone()));
            }
        }
        let entries = tiles
            .iter()
            .enumerate()
            .map(|(idx, tile)| {
                let envelope = rect_envelope(&tile.bounds);
                GeomWithData::new(Rectangle::from_aabb(envelope), idx)
            })
            .collect();
        Ok(Self {
            tiles,
            index: RTree::bulk_load(entries),
            by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn ids(&self) -> Vec<String> {
        self.tiles.iter().map(|tile| tile.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Tile> {
        self.by_id.get(id).map(|&idx| &self.tiles[idx])
    }

    /// Tiles whose bounds intersect `bounds`; callers still clip exactly.
    pub fn candidates(&self, bounds: &Rect<f64>) -> impl Iterator<Item = &Tile> {
        self.index
            .locate_in_envelope_intersecting(&rect_envelope(bounds))
            .map(|entry| &self.tiles[entry.data])
    }

    /// Grid tiles whose id prefixes `value`, as for sheet codes where
    /// `082E045` lies in `082E`.
    pub fn containing_code(&self, value: &str) -> impl Iterator<Item = &Tile> {
        let value = value.trim().to_string();
        self.tiles
            .iter()
            .filter(move |tile| !value.is_empty() && value.starts_with(tile.id.as_str()))
    }
}
