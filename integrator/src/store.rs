//! Tile output store: one zstd-compressed JSON `TileOutput` per tile under
//! `tiles/`, named `roads_{tile}.json.zst`.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use thiserror::Error;

use shared::TileOutput;

const PREFIX: &str = "roads_";
const SUFFIX: &str = ".json.zst";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tile output io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tile output {path} is not valid: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File-name-safe form of a tile id.
pub fn file_stem(tile_id: &str) -> String {
    tile_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TileStore {
    dir: PathBuf,
}

impl TileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic output reference for a tile.
    pub fn reference_for(tile_id: &str) -> String {
        format!("{PREFIX}{}{SUFFIX}", file_stem(tile_id))
    }

    pub fn path_for(&self, reference: &str) -> PathBuf {
        self.dir.join(reference)
    }

    fn partial_path(&self, reference: &str) -> PathBuf {
        self.dir.join(format!(".{reference}.partial"))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Writes a tile output all-or-nothing: the data lands in a partial file
    /// that is renamed into place only once fully flushed.
    pub fn write(&self, output: &TileOutput) -> Result<String, StoreError> {
        fs::create_dir_all(&self.dir).map_err(Self::io_err(&self.dir))?;
        let reference = Self::reference_for(&output.tile_id);
        let partial = self.partial_path(&reference);

        let file = File::create(&partial).map_err(Self::io_err(&partial))?;
        let mut encoder = zstd::stream::write::Encoder::new(file, 3).map_err(Self::io_err(&partial))?;
        serde_json::to_writer(&mut encoder, output).map_err(|source| StoreError::Decode {
            path: partial.clone(),
            source,
        })?;
        let file = encoder.finish().map_err(Self::io_err(&partial))?;
        file.sync_all().map_err(Self::io_err(&partial))?;

        let target = self.path_for(&reference);
        fs::rename(&partial, &target).map_err(Self::io_err(&target))?;
        Ok(reference)
    }

    pub fn read(&self, reference: &str) -> Result<TileOutput, StoreError> {
        let path = self.path_for(reference);
        let file = File::open(&path).map_err(Self::io_err(&path))?;
        let decoder = zstd::stream::read::Decoder::new(file).map_err(Self::io_err(&path))?;
        serde_json::from_reader(BufReader::new(decoder)).map_err(|source| StoreError::Decode {
            path: path.clone(),
            source,
        })
    }

    /// Removes any output, complete or partial, left by an earlier attempt.
    pub fn discard(&self, tile_id: &str) -> Result<bool, StoreError> {
        let reference = Self::reference_for(tile_id);
        let mut removed = false;
        for path in [self.path_for(&reference), self.partial_path(&reference)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        Ok(removed)
    }

    /// Completed outputs found on disk as `(tile stem, reference)`, sorted.
    /// Partial files are ignored.
    pub fn scan(&self) -> Result<Vec<(String, String)>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Self::io_err(&self.dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_prefix(PREFIX).and_then(|rest| rest.strip_suffix(SUFFIX)) {
                found.push((stem.to_string(), name.clone()));
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::TileRow;

    fn output(tile_id: &str) -> TileOutput {
        TileOutput {
            tile_id: tile_id.to_string(),
            columns: vec!["SOURCE_NAME".into(), "EXTRACTION_DATE".into(), "MAP_TILE".into()],
            rows: vec![TileRow {
                values: vec![json!("dra"), json!("2026-01-15"), json!(tile_id)],
                geometry: vec![vec![0.0, 0.0], vec![10.0, 0.0]],
            }],
        }
    }

    #[test]
    fn references_are_deterministic_and_safe() {
        assert_eq!(TileStore::reference_for("082E"), "roads_082E.json.zst");
        assert_eq!(TileStore::reference_for("082 E/1"), "roads_082_E_1.json.zst");
    }

    #[test]
    fn write_then_read_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path().join("tiles"));
        assert!(store.scan().unwrap().is_empty());

        let reference = store.write(&output("082E")).unwrap();
        assert_eq!(store.read(&reference).unwrap(), output("082E"));
        assert_eq!(store.scan().unwrap(), [("082E".to_string(), reference)]);
    }

    #[test]
    fn discard_removes_complete_and_partial_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path());
        store.write(&output("082E")).unwrap();
        fs::write(dir.path().join(".roads_082E.json.zst.partial"), b"garbage").unwrap();

        assert!(store.discard("082E").unwrap());
        assert!(store.scan().unwrap().is_empty());
        assert!(!store.discard("082E").unwrap());
    }

    #[test]
    fn corrupt_output_is_a_decode_or_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path());
        fs::write(dir.path().join("roads_082E.json.zst"), b"not zstd").unwrap();
        assert!(store.read("roads_082E.json.zst").is_err());
    }
}
