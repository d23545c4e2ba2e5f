//! Tiler: partitions each source table by the tile grid and caches the
//! per-tile feature sets under `tiled/{alias}/`.
//!
//! A source is read once, filtered, stamped with provenance, split into
//! tiles and written out. `manifest.json` is written last and lists the tiles
//! the source intersects, so a source with a manifest is fully extracted.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use geo::BoundingRect;
use geo_types::{Geometry, LineString};
use geojson::{Feature, FeatureCollection, JsonObject};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{lookup, PreprocessOperation, Source};
use crate::config::{ExtractOptions, RunContext, Workspace};
use crate::geometry::{clip_line_to_polygon, lines_of};
use crate::grid::TileGrid;
use crate::models::RoadFeature;
use crate::preprocess::{medial_lines, repair_and_explode};
use crate::store::file_stem;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum TilerError {
    #[error("source `{alias}`: cannot read {path}: {source}")]
    Read {
        alias: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source `{alias}`: {path} is not a GeoJSON feature collection: {source}")]
    Parse {
        alias: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("source `{alias}`: cannot write {path}: {source}")]
    Write {
        alias: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source `{alias}`: cannot encode {path}: {source}")]
    Encode {
        alias: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl TilerError {
    pub fn alias(&self) -> &str {
        match self {
            TilerError::Read { alias, .. }
            | TilerError::Parse { alias, .. }
            | TilerError::Write { alias, .. }
            | TilerError::Encode { alias, .. } => alias,
        }
    }
}

/// Cached result of the spatial join for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceManifest {
    pub alias: String,
    pub source_name: String,
    pub extraction_date: String,
    pub operation: String,
    pub features_read: usize,
    pub features_dropped: usize,
    /// Tile id to number of features cached for it.
    pub tiles: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct TiledSource {
    pub manifest: SourceManifest,
    pub tiles: BTreeMap<String, Vec<RoadFeature>>,
}

struct Placement {
    pieces: Vec<(String, RoadFeature)>,
    dropped: bool,
}

impl Placement {
    fn dropped() -> Self {
        Self {
            pieces: Vec::new(),
            dropped: true,
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A source feature that passed the query, with its geometry converted.
/// `geometry` is `None` when the feature has none or it cannot be
/// represented; such features are counted as dropped.
struct SourceRecord {
    properties: JsonObject,
    geometry: Option<Geometry<f64>>,
}

impl SourceRecord {
    fn from_feature(alias: &str, feature: Feature) -> Self {
        let geometry = feature
            .geometry
            .and_then(|geometry| match Geometry::try_from(&geometry.value) {
                Ok(geometry) => Some(geometry),
                Err(err) => {
                    debug!(alias, error = %err, "unconvertible feature geometry");
                    None
                }
            });
        Self {
            properties: feature.properties.unwrap_or_default(),
            geometry,
        }
    }

    fn lines(&self) -> Vec<LineString<f64>> {
        self.geometry.as_ref().map(lines_of).unwrap_or_default()
    }
}

/// Restricts a record to the source's declared fields and stamps provenance.
fn template_feature(source: &Source, properties: &JsonObject, extraction_date: &str) -> RoadFeature {
    let attributes: BTreeMap<String, Value> = source
        .attribute_fields()
        .into_iter()
        .map(|field| {
            let value = lookup(properties, &field).cloned().unwrap_or(Value::Null);
            (field, value)
        })
        .collect();
    let key = source
        .primary_key
        .iter()
        .map(|field| attributes.get(field).map(display_value).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|");
    RoadFeature {
        alias: source.alias.clone(),
        key,
        attributes,
        source_name: source.source_name.clone(),
        extraction_date: extraction_date.to_string(),
        map_tile: String::new(),
        geometry: LineString::new(Vec::new()),
    }
}

fn clip_to_grid(template: &RoadFeature, lines: &[LineString<f64>], grid: &TileGrid) -> Vec<(String, RoadFeature)> {
    let mut pieces = Vec::new();
    for line in lines {
        let Some(bounds) = line.bounding_rect() else {
            continue;
        };
        for tile in grid.candidates(&bounds) {
            for piece in clip_line_to_polygon(line, &tile.polygon) {
                let mut feature = template.with_geometry(piece);
                feature.map_tile = tile.id.clone();
                pieces.push((tile.id.clone(), feature));
            }
        }
    }
    pieces
}

fn place_pretiled(
    source: &Source,
    record: &SourceRecord,
    grid: &TileGrid,
    options: &ExtractOptions,
    extraction_date: &str,
) -> Placement {
    let lines = record.lines();
    let code = lookup(&record.properties, &options.tile_column).map(display_value).unwrap_or_default();
    let tiles: Vec<&str> = grid.containing_code(&code).map(|tile| tile.id.as_str()).collect();
    if lines.is_empty() || tiles.is_empty() {
        return Placement::dropped();
    }
    let mut template = template_feature(source, &record.properties, extraction_date);
    template.map_tile = code;
    let pieces = tiles
        .iter()
        .flat_map(|tile| lines.iter().map(move |line| (tile.to_string(), line)))
        .map(|(tile, line)| (tile, template.with_geometry(line.clone())))
        .collect();
    Placement { pieces, dropped: false }
}

fn place_clipped(source: &Source, record: &SourceRecord, grid: &TileGrid, extraction_date: &str) -> Placement {
    let lines = record.lines();
    if lines.is_empty() {
        return Placement::dropped();
    }
    let template = template_feature(source, &record.properties, extraction_date);
    Placement {
        pieces: clip_to_grid(&template, &lines, grid),
        dropped: false,
    }
}

fn place_polygons(
    source: &Source,
    records: &[SourceRecord],
    grid: &TileGrid,
    options: &ExtractOptions,
    extraction_date: &str,
) -> Vec<Placement> {
    // pass 1: materialise every repaired part before any tiling happens
    let repaired = repair_and_explode(records.iter().filter_map(|record| record.geometry.as_ref()));
    if repaired.dropped > 0 {
        warn!(alias = %source.alias, dropped = repaired.dropped, "dropped unrepairable polygon parts");
    }
    let unusable = records.iter().filter(|record| record.geometry.is_none()).count();
    let id_field = format!("{}_id", source.alias);
    let base = JsonObject::new();

    // pass 2: medial lines, then tile like any line source
    let mut placements: Vec<Placement> = repaired
        .polygons
        .par_iter()
        .enumerate()
        .map(|(idx, polygon)| {
            let lines = medial_lines(polygon, options.medial_step);
            if lines.is_empty() {
                return Placement::dropped();
            }
            let mut template = template_feature(source, &base, extraction_date);
            template.attributes.insert(id_field.clone(), Value::from(idx as u64 + 1));
            template.key = (idx + 1).to_string();
            Placement {
                pieces: clip_to_grid(&template, &lines, grid),
                dropped: false,
            }
        })
        .collect();
    placements.extend((0..unusable).map(|_| Placement::dropped()));
    placements
}

/// Splits one source table into per-tile feature sets.
///
/// # Returns
/// The tiled features plus a manifest recording which tiles were hit and how
/// many input features could not be placed (missing, unsupported or
/// degenerate geometry, or no tile).
pub fn tile_source(
    source: &Source,
    table: FeatureCollection,
    grid: &TileGrid,
    options: &ExtractOptions,
    extraction_date: &str,
) -> TiledSource {
    let no_properties = JsonObject::new();
    let records: Vec<SourceRecord> = table
        .features
        .into_iter()
        .filter(|feature| {
            source.query.as_ref().map_or(true, |query| {
                query.matches(feature.properties.as_ref().unwrap_or(&no_properties))
            })
        })
        .map(|feature| SourceRecord::from_feature(&source.alias, feature))
        .collect();

    let placements: Vec<Placement> = match source.operation {
        PreprocessOperation::None => records
            .par_iter()
            .map(|record| place_pretiled(source, record, grid, options, extraction_date))
            .collect(),
        PreprocessOperation::Tile => records
            .par_iter()
            .map(|record| place_clipped(source, record, grid, extraction_date))
            .collect(),
        PreprocessOperation::RoadPoly2Line => place_polygons(source, &records, grid, options, extraction_date),
    };

    let mut tiles: BTreeMap<String, Vec<RoadFeature>> = BTreeMap::new();
    let mut dropped = 0;
    for placement in placements {
        if placement.dropped {
            dropped += 1;
        }
        for (tile, feature) in placement.pieces {
            tiles.entry(tile).or_default().push(feature);
        }
    }

    let manifest = SourceManifest {
        alias: source.alias.clone(),
        source_name: source.source_name.clone(),
        extraction_date: extraction_date.to_string(),
        operation: source.operation.to_string(),
        features_read: records.len(),
        features_dropped: dropped,
        tiles: tiles.iter().map(|(tile, features)| (tile.clone(), features.len())).collect(),
    };
    TiledSource { manifest, tiles }
}

fn tile_path(workspace: &Workspace, alias: &str, tile_id: &str) -> PathBuf {
    workspace.tiled_dir(alias).join(format!("{}.json.zst", file_stem(tile_id)))
}

fn write_err(alias: &str, path: &Path) -> impl FnOnce(std::io::Error) -> TilerError {
    let alias = alias.to_string();
    let path = path.to_path_buf();
    move |source| TilerError::Write { alias, path, source }
}

/// Replaces the cached tiles of a source. The manifest goes last.
pub fn write_tiled(workspace: &Workspace, tiled: &TiledSource) -> Result<(), TilerError> {
    let alias = &tiled.manifest.alias;
    let dir = workspace.tiled_dir(alias);
    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(write_err(alias, &dir)(err)),
    }
    fs::create_dir_all(&dir).map_err(write_err(alias, &dir))?;

    for (tile_id, features) in &tiled.tiles {
        let path = tile_path(workspace, alias, tile_id);
        let file = File::create(&path).map_err(write_err(alias, &path))?;
        let mut encoder = zstd::stream::write::Encoder::new(file, 3).map_err(write_err(alias, &path))?;
        serde_json::to_writer(&mut encoder, features).map_err(|source| TilerError::Encode {
            alias: alias.clone(),
            path: path.clone(),
            source,
        })?;
        encoder.finish().map_err(write_err(alias, &path))?;
    }

    let path = dir.join(MANIFEST_FILE);
    let file = File::create(&path).map_err(write_err(alias, &path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &tiled.manifest).map_err(|source| TilerError::Encode {
        alias: alias.clone(),
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// `Ok(None)` when the source has not been extracted (or extraction never
/// finished).
pub fn read_manifest(workspace: &Workspace, alias: &str) -> Result<Option<SourceManifest>, TilerError> {
    let path = workspace.tiled_dir(alias).join(MANIFEST_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(TilerError::Read {
                alias: alias.to_string(),
                path,
                source,
            })
        }
    };
    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|source| TilerError::Parse {
            alias: alias.to_string(),
            path,
            source,
        })
}

/// Cached features of one source in one tile. Empty when the manifest does
/// not list the tile.
pub fn read_tile_features(
    workspace: &Workspace,
    manifest: &SourceManifest,
    tile_id: &str,
) -> Result<Vec<RoadFeature>, TilerError> {
    if !manifest.tiles.contains_key(tile_id) {
        return Ok(Vec::new());
    }
    let alias = &manifest.alias;
    let path = tile_path(workspace, alias, tile_id);
    let read_err = |source| TilerError::Read {
        alias: alias.clone(),
        path: path.clone(),
        source,
    };
    let file = File::open(&path).map_err(read_err)?;
    let decoder = zstd::stream::read::Decoder::new(file).map_err(read_err)?;
    serde_json::from_reader(BufReader::new(decoder)).map_err(|source| TilerError::Parse {
        alias: alias.clone(),
        path: path.clone(),
        source,
    })
}

fn read_table(workspace: &Workspace, source: &Source) -> Result<FeatureCollection, TilerError> {
    let path = workspace.source_table(&source.alias);
    let file = File::open(&path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound && source.manual_download {
            warn!(alias = %source.alias, path = %path.display(), "source must be downloaded manually");
        }
        TilerError::Read {
            alias: source.alias.clone(),
            path: path.clone(),
            source: err,
        }
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| TilerError::Parse {
        alias: source.alias.clone(),
        path: path.clone(),
        source: err,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Extracted { tiles: usize },
    Cached,
}

/// Tiles one source unless a complete cache already exists.
pub fn extract_source(
    ctx: &RunContext,
    source: &Source,
    force: bool,
    extraction_date: &str,
) -> Result<ExtractOutcome, TilerError> {
    if !force && read_manifest(&ctx.workspace, &source.alias)?.is_some() {
        debug!(alias = %source.alias, "tiled cache present, skipping");
        return Ok(ExtractOutcome::Cached);
    }
    let table = read_table(&ctx.workspace, source)?;
    let tiled = tile_source(source, table, &ctx.grid, &ctx.extract, extraction_date);
    if tiled.manifest.features_dropped > 0 {
        warn!(
            alias = %source.alias,
            dropped = tiled.manifest.features_dropped,
            "features without usable geometry or tile"
        );
    }
    write_tiled(&ctx.workspace, &tiled)?;
    Ok(ExtractOutcome::Extracted {
        tiles: tiled.tiles.len(),
    })
}

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<String>,
    pub cached: Vec<String>,
    pub failed: Vec<String>,
}

/// Extracts every prioritized source (or just `only`). A failing source is
/// logged and reported; the others still run.
pub fn extract_all(ctx: &RunContext, only: Option<&str>, force: bool) -> ExtractReport {
    let extraction_date = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
    let mut report = ExtractReport::default();
    for source in ctx.catalog.conflated().filter(|source| only.map_or(true, |alias| source.alias == alias)) {
        match extract_source(ctx, source, force, &extraction_date) {
            Ok(ExtractOutcome::Extracted { tiles }) => {
                info!(alias = %source.alias, tiles, operation = %source.operation, "source extracted");
                report.extracted.push(source.alias.clone());
            }
            Ok(ExtractOutcome::Cached) => report.cached.push(source.alias.clone()),
            Err(err) => {
                warn!(alias = err.alias(), error = %err, "source extraction failed; source treated as absent");
                report.failed.push(source.alias.clone());
            }
        }
    }
    report
}
