//! File loaders, selected by extension

use crate::error::{DashError, Result, ResultExt};
use crate::types::{ImageData, SourceValue, Table};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Extensions decoded into pixel arrays
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

/// Name of the state file of an object-store directory
pub const OBJECT_STORE_STATE: &str = "state.json";

/// Directory next to the state file holding externally stored members
pub const OBJECT_STORE_EXTERN: &str = "extern";

/// Marker key of a member whose value lives in the extern directory
pub const EXTERN_KEY: &str = "__extern__";

/// Load a file into a snapshot according to its extension
pub fn load_file(path: &Path) -> Result<SourceValue> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        e if IMAGE_EXTENSIONS.contains(&e) => load_image(path),
        "csv" => load_csv(path),
        "json" if is_object_store(path) => load_object_store(path),
        "json" => load_json(path),
        _ => load_text(path),
    }
}

/// `state.json` next to an `extern/` directory
pub fn is_object_store(path: &Path) -> bool {
    path.file_name().is_some_and(|n| n == OBJECT_STORE_STATE)
        && path
            .parent()
            .is_some_and(|dir| dir.join(OBJECT_STORE_EXTERN).is_dir())
}

pub fn load_image(path: &Path) -> Result<SourceValue> {
    let img = image::open(path)?;
    let (width, height) = (img.width(), img.height());
    let (channels, pixels) = match img.color().channel_count() {
        1 => (1, img.into_luma8().into_raw()),
        2 => (2, img.into_luma_alpha8().into_raw()),
        3 => (3, img.into_rgb8().into_raw()),
        _ => (4, img.into_rgba8().into_raw()),
    };
    Ok(SourceValue::Image(Arc::new(ImageData {
        width,
        height,
        channels,
        pixels,
    })))
}

/// Comma-separated numbers; cells that do not parse become NaN
pub fn load_csv(path: &Path) -> Result<SourceValue> {
    let content = std::fs::read_to_string(path)?;
    Ok(SourceValue::Table(Arc::new(parse_csv(&content))))
}

pub fn parse_csv(content: &str) -> Table {
    let rows = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| {
            line.split(',')
                .map(|cell| cell.trim().parse::<f64>().unwrap_or(f64::NAN))
                .collect()
        })
        .collect();
    Table::from_rows(rows)
}

pub fn load_json(path: &Path) -> Result<SourceValue> {
    let content = std::fs::read_to_string(path)?;
    let doc: Value = serde_json::from_str(&content)?;
    Ok(SourceValue::Document(doc))
}

/// Load an object-store directory: the state document with every extern
/// member replaced by the contents of its file
pub fn load_object_store(state_path: &Path) -> Result<SourceValue> {
    let mut doc = match load_json(state_path)? {
        SourceValue::Document(doc) => doc,
        other => return Ok(other),
    };
    let extern_dir = state_path
        .parent()
        .map(|dir| dir.join(OBJECT_STORE_EXTERN))
        .ok_or_else(|| DashError::Path(format!("{:?} has no parent directory", state_path)))?;

    resolve_externs(&mut doc, &extern_dir)?;
    Ok(SourceValue::Document(doc))
}

fn resolve_externs(value: &mut Value, extern_dir: &Path) -> Result<()> {
    let extern_file = match value {
        Value::Object(map) if map.len() == 1 => map
            .get(EXTERN_KEY)
            .and_then(Value::as_str)
            .map(|file| extern_dir.join(file)),
        _ => None,
    };
    if let Some(file_path) = extern_file {
        let loaded = load_file(&file_path)
            .with_context(|| format!("loading extern member {:?}", file_path))?;
        *value = loaded.to_json();
        return Ok(());
    }

    match value {
        Value::Object(map) => {
            for member in map.values_mut() {
                resolve_externs(member, extern_dir)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_externs(item, extern_dir)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// UTF-8 text; anything else is kept as raw bytes
pub fn load_text(path: &Path) -> Result<SourceValue> {
    let bytes = std::fs::read(path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => SourceValue::Text(text),
        Err(e) => SourceValue::Bytes(Arc::new(e.into_bytes())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_csv_with_bad_cells() {
        let t = parse_csv("1,2,3\n4,x,6\n\n7,8\n");
        assert_eq!((t.rows, t.cols), (3, 3));
        assert_eq!(t.get(0, 2), Some(3.0));
        assert!(t.get(1, 1).unwrap().is_nan());
        assert!(t.get(2, 2).unwrap().is_nan());
    }

    #[test]
    fn test_dispatch_by_extension() {
        let dir = tempdir().unwrap();

        let json_path = dir.path().join("a.JSON");
        std::fs::write(&json_path, r#"{"k": [1, 2]}"#).unwrap();
        assert_eq!(load_file(&json_path).unwrap(), SourceValue::Document(json!({"k": [1, 2]})));

        let txt = dir.path().join("notes.log");
        std::fs::write(&txt, "hello").unwrap();
        assert_eq!(load_file(&txt).unwrap(), SourceValue::Text("hello".into()));

        let bin = dir.path().join("blob.bin");
        std::fs::write(&bin, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(load_file(&bin).unwrap(), SourceValue::Bytes(_)));

        let bad = dir.path().join("broken.json");
        std::fs::write(&bad, "{").unwrap();
        assert!(load_file(&bad).is_err());
    }

    #[test]
    fn test_png_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.png");
        let img = image::RgbImage::from_fn(2, 3, |x, y| image::Rgb([x as u8, y as u8, 7]));
        img.save(&path).unwrap();

        let SourceValue::Image(data) = load_file(&path).unwrap() else {
            panic!("expected image");
        };
        assert_eq!((data.width, data.height, data.channels), (2, 3, 3));
        assert_eq!(&data.pixels[..3], &[0, 0, 7]);
    }

    #[test]
    fn test_object_store_layout() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("extern")).unwrap();
        std::fs::write(dir.path().join("extern").join("points.csv"), "1,2\n3,4\n").unwrap();
        std::fs::write(
            dir.path().join("state.json"),
            r#"{"name": "run", "points": {"__extern__": "points.csv"}}"#,
        )
        .unwrap();

        let v = load_file(&dir.path().join("state.json")).unwrap();
        assert_eq!(
            v,
            SourceValue::Document(json!({"name": "run", "points": [[1.0, 2.0], [3.0, 4.0]]}))
        );
    }

    #[test]
    fn test_plain_state_json_without_extern_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"x": {"__extern__": "missing.csv"}}"#).unwrap();
        assert!(!is_object_store(&path));
        assert!(load_file(&path).is_ok());
    }
}
