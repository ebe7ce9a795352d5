//! Core data types for imdash-core
//!
//! This module contains the value snapshots that sources hand out and the
//! conversions between those snapshots and the expression engine.
//!
//! # Main Types
//!
//! - [`SourceValue`] - Snapshot of a source's current data
//! - [`Table`] - Numeric table loaded from CSV files
//! - [`ImageData`] - Decoded pixel array (images on disk or image messages)
//!
//! # Sharing
//!
//! Large payloads (tables, images) are reference counted so that handing a
//! snapshot to an expression every frame does not copy the pixels.

use crate::path::SubPath;
use rhai::{Array, Dynamic, Map};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A two-dimensional numeric table in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

impl Table {
    /// Build a table from rows; short rows are padded with NaN
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let cols = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let mut values = Vec::with_capacity(rows.len() * cols);
        for row in &rows {
            values.extend(row.iter().copied());
            values.extend(std::iter::repeat(f64::NAN).take(cols - row.len()));
        }
        Self {
            rows: rows.len(),
            cols,
            values,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            self.values.get(row * self.cols + col).copied()
        } else {
            None
        }
    }

    pub fn row(&self, row: usize) -> Option<&[f64]> {
        if row < self.rows {
            Some(&self.values[row * self.cols..(row + 1) * self.cols])
        } else {
            None
        }
    }

    /// Single-row and single-column tables collapse to a flat array, like a squeezed numpy array
    pub fn to_dynamic(&self) -> Dynamic {
        if self.rows == 1 || self.cols == 1 {
            let flat: Array = self.values.iter().map(|v| Dynamic::from_float(*v)).collect();
            return Dynamic::from_array(flat);
        }
        let rows: Array = (0..self.rows)
            .filter_map(|r| self.row(r))
            .map(|row| Dynamic::from_array(row.iter().map(|v| Dynamic::from_float(*v)).collect()))
            .collect();
        Dynamic::from_array(rows)
    }
}

/// A decoded image: `height x width x channels` bytes in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl ImageData {
    pub fn to_dynamic(&self) -> Dynamic {
        let mut map = Map::new();
        map.insert("width".into(), Dynamic::from_int(self.width as rhai::INT));
        map.insert("height".into(), Dynamic::from_int(self.height as rhai::INT));
        map.insert("channels".into(), Dynamic::from_int(self.channels as rhai::INT));
        map.insert("pixels".into(), Dynamic::from_blob(self.pixels.clone()));
        Dynamic::from_map(map)
    }
}

/// Snapshot of a source's data
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SourceValue {
    /// No data (absent source or nothing received yet)
    #[default]
    None,
    /// Raw text file contents or string messages
    Text(String),
    /// Undecodable raw bytes
    Bytes(Arc<Vec<u8>>),
    /// A single number
    Number(f64),
    /// Numeric table
    Table(Arc<Table>),
    /// Pixel array
    Image(Arc<ImageData>),
    /// Structured document (JSON files, decoded messages, store contents)
    Document(Value),
}

impl SourceValue {
    pub fn is_none(&self) -> bool {
        matches!(self, SourceValue::None)
    }

    /// Select a sub-value. Only documents and tables can be addressed into;
    /// an empty path returns the value itself.
    pub fn select(&self, path: &SubPath) -> SourceValue {
        if path.is_empty() {
            return self.clone();
        }
        match self {
            SourceValue::Document(doc) => path
                .lookup(doc)
                .cloned()
                .map(SourceValue::Document)
                .unwrap_or_default(),
            SourceValue::Table(table) => {
                let segments = path.segments();
                match (segments.first().and_then(|s| s.as_index()), segments.get(1)) {
                    (Some(r), None) => table
                        .row(r)
                        .map(|row| SourceValue::Table(Arc::new(Table::from_rows(vec![row.to_vec()]))))
                        .unwrap_or_default(),
                    (Some(r), Some(c)) if segments.len() == 2 => c
                        .as_index()
                        .and_then(|c| table.get(r, c))
                        .map(SourceValue::Number)
                        .unwrap_or_default(),
                    _ => SourceValue::None,
                }
            }
            _ => SourceValue::None,
        }
    }

    /// Convert to a value the expression engine can bind
    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            SourceValue::None => Dynamic::UNIT,
            SourceValue::Text(s) => Dynamic::from(s.clone()),
            SourceValue::Bytes(b) => Dynamic::from_blob(b.as_ref().clone()),
            SourceValue::Number(n) => Dynamic::from_float(*n),
            SourceValue::Table(t) => t.to_dynamic(),
            SourceValue::Image(img) => img.to_dynamic(),
            SourceValue::Document(doc) => json_to_dynamic(doc),
        }
    }

    /// Best-effort conversion to JSON, used for writes and logging
    pub fn to_json(&self) -> Value {
        match self {
            SourceValue::None => Value::Null,
            SourceValue::Text(s) => Value::String(s.clone()),
            SourceValue::Bytes(b) => Value::from(b.as_ref().clone()),
            SourceValue::Number(n) => Value::from(*n),
            SourceValue::Table(t) => Value::Array(
                (0..t.rows)
                    .filter_map(|r| t.row(r))
                    .map(|row| Value::from(row.to_vec()))
                    .collect(),
            ),
            SourceValue::Image(img) => serde_json::json!({
                "width": img.width,
                "height": img.height,
                "channels": img.channels,
            }),
            SourceValue::Document(doc) => doc.clone(),
        }
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceValue::None => write!(f, "none"),
            SourceValue::Text(s) => write!(f, "text ({} chars)", s.chars().count()),
            SourceValue::Bytes(b) => write!(f, "{} bytes", b.len()),
            SourceValue::Number(n) => write!(f, "{}", n),
            SourceValue::Table(t) => write!(f, "table {}x{}", t.rows, t.cols),
            SourceValue::Image(img) => {
                write!(f, "image {}x{}x{}", img.height, img.width, img.channels)
            }
            SourceValue::Document(doc) => write!(f, "{}", doc),
        }
    }
}

/// Convert a JSON document to a script value
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

/// Convert a script value back to JSON
pub fn dynamic_to_json(value: &Dynamic) -> crate::error::Result<Value> {
    rhai::serde::from_dynamic::<Value>(value).map_err(crate::error::DashError::from_rhai_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_padding() {
        let t = Table::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0]]);
        assert_eq!(t.rows, 2);
        assert_eq!(t.cols, 3);
        assert_eq!(t.get(1, 0), Some(4.0));
        assert!(t.get(1, 2).unwrap().is_nan());
        assert_eq!(t.get(2, 0), None);
    }

    #[test]
    fn test_table_dynamic_shape() {
        let flat = Table::from_rows(vec![vec![1.0, 2.0]]).to_dynamic();
        assert_eq!(flat.into_array().unwrap().len(), 2);

        let grid = Table::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
        let rows = grid.to_dynamic().into_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_array());
    }

    #[test]
    fn test_select_document() {
        let v = SourceValue::Document(json!({"a": {"b": [10, 20]}}));
        let sel = v.select(&SubPath::parse("a.b[1]").unwrap());
        assert_eq!(sel, SourceValue::Document(json!(20)));
        assert!(v.select(&SubPath::parse("a.c").unwrap()).is_none());
    }

    #[test]
    fn test_select_table_cell() {
        let t = SourceValue::Table(Arc::new(Table::from_rows(vec![
            vec![1.0, 2.0],
            vec![3.0, 4.0],
        ])));
        assert_eq!(t.select(&SubPath::parse("[1][0]").unwrap()), SourceValue::Number(3.0));
    }

    #[test]
    fn test_json_dynamic_round() {
        let doc = json!({"x": 1.5, "tags": ["a", "b"]});
        let dynv = json_to_dynamic(&doc);
        assert_eq!(dynamic_to_json(&dynv).unwrap(), doc);
    }
}
