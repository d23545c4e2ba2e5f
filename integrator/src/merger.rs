//! Post-pass that folds every completed tile output into the single merged
//! layer.
//!
//! The layer is newline-delimited JSON: a [`LayerHeader`] line naming the
//! union schema, then one GeoJSON feature per row. The first readable tile
//! creates the layer; every other tile is reconciled in parallel and appended
//! under a lock, so append order across tiles is unspecified. A tile that
//! cannot be read, reconciled or written is skipped and reported.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use geojson::{Feature, Geometry, JsonObject};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use shared::{LayerHeader, TileRow, MERGED_LAYER_NAME};

use crate::ledger::TileJob;
use crate::schema::reconcile;
use crate::store::TileStore;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merged output io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("merged output {path} has an unreadable header: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("merged output {path} was written with a different layout")]
    LayoutMismatch { path: PathBuf },
    #[error("row has {found} values but the layer has {expected} columns")]
    Arity { expected: usize, found: usize },
    #[error("failed to encode merged feature: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("merged output lock poisoned")]
    Poisoned,
}

/// A tile whose conflation finished, with the store reference of its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTile {
    pub tile_id: String,
    pub output_reference: String,
}

impl CompletedTile {
    pub fn from_job(job: TileJob) -> Option<Self> {
        let output_reference = job.output_reference?;
        Some(Self {
            tile_id: job.tile_id,
            output_reference,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTile {
    pub tile_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub tiles_appended: usize,
    pub tiles_empty: usize,
    pub rows_written: usize,
    pub skipped: Vec<SkippedTile>,
    /// False when no tile could be read and the layer was never created.
    pub output_created: bool,
}

impl MergeReport {
    fn record(&mut self, outcome: TileOutcome) {
        match outcome {
            TileOutcome::Appended(rows) => {
                self.tiles_appended += 1;
                self.rows_written += rows;
            }
            TileOutcome::Empty => self.tiles_empty += 1,
            TileOutcome::Skipped(skipped) => self.skipped.push(skipped),
        }
    }
}

/// Append handle on the merged layer.
pub struct OutputLayer<W: Write = File> {
    path: PathBuf,
    columns: Vec<String>,
    writer: W,
}

impl OutputLayer {
    /// Creates the layer with `columns`, or reopens an existing layer for
    /// appending after checking that its header matches.
    pub fn open_or_create(path: &Path, columns: &[String]) -> Result<Self, MergeError> {
        let io_err = |source| MergeError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = match read_header(path)? {
            Some(header) => {
                if header.layer != MERGED_LAYER_NAME || header.columns != columns {
                    return Err(MergeError::LayoutMismatch {
                        path: path.to_path_buf(),
                    });
                }
                OpenOptions::new().append(true).open(path).map_err(io_err)?
            }
            None => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                let mut file = File::create(path).map_err(io_err)?;
                let header = LayerHeader {
                    layer: MERGED_LAYER_NAME.to_string(),
                    columns: columns.to_vec(),
                };
                serde_json::to_writer(&mut file, &header)?;
                file.write_all(b"\n").map_err(io_err)?;
                file
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            columns: columns.to_vec(),
            writer: file,
        })
    }

    pub fn finish(mut self) -> Result<(), MergeError> {
        let io_err = |source| MergeError::Io {
            path: self.path.clone(),
            source,
        };
        self.writer.flush().map_err(io_err)?;
        self.writer.sync_all().map_err(io_err)
    }
}

impl<W: Write> OutputLayer<W> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Appends rows already aligned with the layer columns in one write.
    /// Nothing is written if any row has the wrong arity.
    pub fn append(&mut self, rows: &[TileRow]) -> Result<usize, MergeError> {
        if let Some(row) = rows.iter().find(|row| row.values.len() != self.columns.len()) {
            return Err(MergeError::Arity {
                expected: self.columns.len(),
                found: row.values.len(),
            });
        }

        let io_err = |source| MergeError::Io {
            path: self.path.clone(),
            source,
        };
        let mut buf = Vec::new();
        for row in rows {
            let properties: JsonObject = self.columns.iter().cloned().zip(row.values.iter().cloned()).collect();
            let feature = Feature {
                bbox: None,
                geometry: Some(Geometry::new(geojson::Value::LineString(row.geometry.clone()))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            };
            serde_json::to_writer(&mut buf, &feature)?;
            buf.push(b'\n');
        }
        self.writer.write_all(&buf).map_err(io_err)?;
        self.writer.flush().map_err(io_err)?;
        Ok(rows.len())
    }
}

fn read_header(path: &Path) -> Result<Option<LayerHeader>, MergeError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MergeError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|source| MergeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|source| MergeError::Header {
            path: path.to_path_buf(),
            source,
        })
}

enum TileOutcome {
    Appended(usize),
    Empty,
    Skipped(SkippedTile),
}

pub struct Merger<'a> {
    store: &'a TileStore,
    columns: Vec<String>,
}

impl<'a> Merger<'a> {
    /// `columns` is the union schema every tile is reconciled against.
    pub fn new(store: &'a TileStore, columns: Vec<String>) -> Self {
        Self { store, columns }
    }

    fn load(&self, tile: &CompletedTile) -> Result<Vec<TileRow>, String> {
        let output = self
            .store
            .read(&tile.output_reference)
            .map_err(|err| err.to_string())?;
        reconcile(&output, &self.columns).map_err(|err| err.to_string())
    }

    fn skip(tile: &CompletedTile, reason: String) -> SkippedTile {
        warn!(tile = %tile.tile_id, reference = %tile.output_reference, %reason, "skipping tile output");
        SkippedTile {
            tile_id: tile.tile_id.clone(),
            reason,
        }
    }

    /// Appends one tile's reconciled rows. A write failure skips the tile.
    fn append_rows<W: Write>(
        &self,
        layer: &Mutex<OutputLayer<W>>,
        tile: &CompletedTile,
        rows: Vec<TileRow>,
    ) -> Result<TileOutcome, MergeError> {
        if rows.is_empty() {
            return Ok(TileOutcome::Empty);
        }
        let mut guard = layer.lock().map_err(|_| MergeError::Poisoned)?;
        Ok(match guard.append(&rows) {
            Ok(written) => TileOutcome::Appended(written),
            Err(err) => TileOutcome::Skipped(Self::skip(tile, err.to_string())),
        })
    }

    fn append_tiles<W: Write + Send>(
        &self,
        layer: &Mutex<OutputLayer<W>>,
        tiles: &[CompletedTile],
        report: &mut MergeReport,
    ) -> Result<(), MergeError> {
        let outcomes: Vec<Result<TileOutcome, MergeError>> = tiles
            .par_iter()
            .map(|tile| match self.load(tile) {
                Ok(rows) => self.append_rows(layer, tile, rows),
                Err(reason) => Ok(TileOutcome::Skipped(Self::skip(tile, reason))),
            })
            .collect();
        for outcome in outcomes {
            report.record(outcome?);
        }
        Ok(())
    }

    pub fn merge(&self, tiles: &[CompletedTile], output: &Path) -> Result<MergeReport, MergeError> {
        let mut report = MergeReport::default();

        // The layer is created from the first tile that can be read.
        let mut first = None;
        let mut remaining = tiles;
        while let Some((tile, rest)) = remaining.split_first() {
            remaining = rest;
            match self.load(tile) {
                Ok(rows) => {
                    first = Some((tile, rows));
                    break;
                }
                Err(reason) => report.skipped.push(Self::skip(tile, reason)),
            }
        }
        let Some((tile, rows)) = first else {
            warn!(tiles = tiles.len(), "no readable tile output; merged layer not created");
            return Ok(report);
        };

        let layer = Mutex::new(OutputLayer::open_or_create(output, &self.columns)?);
        report.output_created = true;
        report.record(self.append_rows(&layer, tile, rows)?);
        self.append_tiles(&layer, remaining, &mut report)?;
        layer.into_inner().map_err(|_| MergeError::Poisoned)?.finish()?;

        info!(
            path = %output.display(),
            tiles = report.tiles_appended,
            empty = report.tiles_empty,
            rows = report.rows_written,
            skipped = report.skipped.len(),
            "merged tile outputs"
        );
        Ok(report)
    }
}

/// Reads the merged layer back as its header and features.
pub fn read_layer(path: &Path) -> Result<(LayerHeader, Vec<Feature>), MergeError> {
    let io_err = |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut lines = reader.lines();
    let header_line = lines.next().transpose().map_err(io_err)?.unwrap_or_default();
    let header: LayerHeader = serde_json::from_str(&header_line).map_err(|source| MergeError::Header {
        path: path.to_path_buf(),
        source,
    })?;
    let mut features = Vec::new();
    for line in lines {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        features.push(serde_json::from_str(&line)?);
    }
    Ok((header, features))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use shared::TileOutput;

    fn property<'a>(feature: &'a Feature, column: &str) -> &'a Value {
        &feature.properties.as_ref().unwrap()[column]
    }

    /// Accepts nothing, like a full disk.
    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn columns() -> Vec<String> {
        ["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE", "DRA_ID", "FTEN_LABEL"]
            .map(String::from)
            .to_vec()
    }

    fn write_tile(store: &TileStore, tile_id: &str, columns: &[&str], values: Vec<Vec<Value>>) -> CompletedTile {
        let output = TileOutput {
            tile_id: tile_id.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: values
                .into_iter()
                .map(|values| TileRow {
                    values,
                    geometry: vec![vec![0.0, 0.0], vec![5.0, 5.0]],
                })
                .collect(),
        };
        CompletedTile {
            tile_id: tile_id.to_string(),
            output_reference: store.write(&output).unwrap(),
        }
    }

    #[test]
    fn merges_heterogeneous_tiles_into_union_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path().join("tiles"));
        let a = write_tile(
            &store,
            "A",
            &["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE", "DRA_ID"],
            vec![vec![json!("DRA"), json!("2026-01-15"), json!("A"), json!(7)]],
        );
        let b = write_tile(
            &store,
            "B",
            &["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE", "FTEN_LABEL"],
            vec![
                vec![json!("FTEN"), json!("2026-01-15"), json!("B"), json!("R1")],
                vec![json!("FTEN"), json!("2026-01-15"), json!("B"), json!("R2")],
            ],
        );
        let empty = write_tile(&store, "C", &["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE"], vec![]);

        let output = dir.path().join("merged.ndjson");
        let report = Merger::new(&store, columns()).merge(&[a, b, empty], &output).unwrap();
        assert_eq!(report.tiles_appended, 2);
        assert_eq!(report.tiles_empty, 1);
        assert_eq!(report.rows_written, 3);
        assert!(report.skipped.is_empty());

        let (header, features) = read_layer(&output).unwrap();
        assert_eq!(header.layer, MERGED_LAYER_NAME);
        assert_eq!(header.columns, columns());
        assert_eq!(features.len(), 3);
        for feature in &features {
            assert_eq!(feature.properties.as_ref().unwrap().len(), 5);
            assert!(matches!(
                feature.geometry.as_ref().map(|g| &g.value),
                Some(geojson::Value::LineString(coords)) if coords.len() == 2
            ));
        }
        let dra = features.iter().find(|f| property(f, "SOURCE_NAME") == &json!("DRA")).unwrap();
        assert_eq!(property(dra, "FTEN_LABEL"), &Value::Null);
        assert_eq!(property(dra, "DRA_ID"), &json!(7));
    }

    #[test]
    fn missing_and_foreign_tiles_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path());
        let missing = CompletedTile {
            tile_id: "gone".to_string(),
            output_reference: "roads_gone.json.zst".to_string(),
        };
        let foreign = write_tile(&store, "X", &["SOURCE_NAME", "OTHER"], vec![]);
        let good = write_tile(
            &store,
            "A",
            &["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE"],
            vec![vec![json!("DRA"), json!("2026-01-15"), json!("A")]],
        );

        let output = dir.path().join("merged.ndjson");
        let report = Merger::new(&store, columns())
            .merge(&[missing, foreign, good], &output)
            .unwrap();
        assert_eq!(report.rows_written, 1);
        let skipped: Vec<_> = report.skipped.iter().map(|s| s.tile_id.as_str()).collect();
        assert_eq!(skipped, ["gone", "X"]);
    }

    #[test]
    fn tile_that_cannot_be_written_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path());
        let a = write_tile(
            &store,
            "A",
            &["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE"],
            vec![vec![json!("DRA"), json!("2026-01-15"), json!("A")]],
        );
        let empty = write_tile(&store, "C", &["SOURCE_NAME", "EXTRACTION_DATE", "MAP_TILE"], vec![]);
        let layer = Mutex::new(OutputLayer {
            path: dir.path().join("merged.ndjson"),
            columns: columns(),
            writer: FullDisk,
        });

        let mut report = MergeReport::default();
        Merger::new(&store, columns())
            .append_tiles(&layer, &[a, empty], &mut report)
            .unwrap();
        assert_eq!(report.tiles_appended, 0);
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.tiles_empty, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].tile_id, "A");
        assert!(report.skipped[0].reason.contains("no space left"));
    }

    #[test]
    fn nothing_readable_leaves_no_layer() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path());
        let missing = CompletedTile {
            tile_id: "gone".to_string(),
            output_reference: "roads_gone.json.zst".to_string(),
        };
        let output = dir.path().join("merged.ndjson");
        let report = Merger::new(&store, columns()).merge(&[missing], &output).unwrap();
        assert!(!report.output_created);
        assert!(!output.exists());
    }

    #[test]
    fn existing_layer_is_appended_only_when_layout_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.ndjson");
        let row = TileRow {
            values: vec![json!("DRA"), json!("d"), json!("A"), json!(1), Value::Null],
            geometry: vec![vec![0.0, 0.0], vec![1.0, 0.0]],
        };

        let mut layer = OutputLayer::open_or_create(&path, &columns()).unwrap();
        layer.append(&[row.clone()]).unwrap();
        layer.finish().unwrap();

        let mut layer = OutputLayer::open_or_create(&path, &columns()).unwrap();
        layer.append(&[row.clone()]).unwrap();
        layer.finish().unwrap();
        assert_eq!(read_layer(&path).unwrap().1.len(), 2);

        let other = vec!["SOURCE_NAME".to_string()];
        assert!(matches!(
            OutputLayer::open_or_create(&path, &other),
            Err(MergeError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn append_rejects_misaligned_rows_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.ndjson");
        let mut layer = OutputLayer::open_or_create(&path, &columns()).unwrap();
        let short = TileRow {
            values: vec![json!("DRA")],
            geometry: vec![vec![0.0, 0.0], vec![1.0, 0.0]],
        };
        assert!(matches!(
            layer.append(&[short]),
            Err(MergeError::Arity { expected: 5, found: 1 })
        ));
        layer.finish().unwrap();
        assert!(read_layer(&path).unwrap().1.is_empty());
    }
}
