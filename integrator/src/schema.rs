//! Column layouts: the working schema of a single tile and its
//! reconciliation against the union schema of the whole run.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use shared::{TileOutput, TileRow, PROVENANCE_COLUMNS};

use crate::catalog::Catalog;
use crate::conflation::ConflatedTile;
use crate::geometry::positions_from_line;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaMismatch {
    #[error("column `{0}` is not part of the merged schema")]
    UnknownColumn(String),
    #[error("column `{0}` appears more than once")]
    DuplicateColumn(String),
    #[error("row {row} has {found} values for {expected} columns")]
    RowArity { row: usize, expected: usize, found: usize },
    #[error("row {row} has fewer than two vertices")]
    Geometry { row: usize },
}

/// Provenance columns followed by the columns of every contributing source,
/// in catalog priority order.
pub fn tile_columns(catalog: &Catalog, contributing: &[String]) -> Vec<String> {
    PROVENANCE_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain(
            catalog
                .conflated()
                .filter(|source| contributing.contains(&source.alias))
                .flat_map(|source| source.output_columns()),
        )
        .collect()
}

/// Lays out a conflated tile as rows of its own working schema. Attributes
/// of sources other than a row's owner are null.
pub fn build_tile_output(catalog: &Catalog, tile: &ConflatedTile) -> TileOutput {
    let sources: Vec<_> = catalog
        .conflated()
        .filter(|source| tile.contributing.contains(&source.alias))
        .map(|source| (source.alias.as_str(), source.output_fields()))
        .collect();

    let rows = tile
        .features
        .iter()
        .map(|feature| {
            let mut values = vec![
                Value::String(feature.source_name.clone()),
                Value::String(feature.extraction_date.clone()),
                Value::String(feature.map_tile.clone()),
            ];
            for (alias, fields) in &sources {
                for field in fields {
                    let value = if feature.alias == *alias {
                        feature.attributes.get(field).cloned().unwrap_or(Value::Null)
                    } else {
                        Value::Null
                    };
                    values.push(value);
                }
            }
            TileRow {
                values,
                geometry: positions_from_line(&feature.geometry),
            }
        })
        .collect();

    TileOutput {
        tile_id: tile.tile_id.clone(),
        columns: tile_columns(catalog, &tile.contributing),
        rows,
    }
}

/// Maps a tile's rows onto the union schema, filling absent columns with
/// null. A tile naming a column outside the union schema is rejected whole.
pub fn reconcile(output: &TileOutput, union: &[String]) -> Result<Vec<TileRow>, SchemaMismatch> {
    let positions: HashMap<&str, usize> = union
        .iter()
        .enumerate()
        .map(|(idx, column)| (column.as_str(), idx))
        .collect();

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(output.columns.len());
    for column in &output.columns {
        if !seen.insert(column.as_str()) {
            return Err(SchemaMismatch::DuplicateColumn(column.clone()));
        }
        let idx = positions
            .get(column.as_str())
            .ok_or_else(|| SchemaMismatch::UnknownColumn(column.clone()))?;
        targets.push(*idx);
    }

    output
        .rows
        .iter()
        .enumerate()
        .map(|(row, tile_row)| {
            if tile_row.values.len() != targets.len() {
                return Err(SchemaMismatch::RowArity {
                    row,
                    expected: targets.len(),
                    found: tile_row.values.len(),
                });
            }
            if tile_row.geometry.len() < 2 {
                return Err(SchemaMismatch::Geometry { row });
            }
            let mut values = vec![Value::Null; union.len()];
            for (target, value) in targets.iter().zip(&tile_row.values) {
                values[*target] = value.clone();
            }
            Ok(TileRow {
                values,
                geometry: tile_row.geometry.clone(),
            })
        })
        .collect()
}
