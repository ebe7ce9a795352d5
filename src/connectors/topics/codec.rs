//! Message decoding by advertised type name
//!
//! Feeds deliver raw bytes; the type name a feed advertises selects the
//! decoder. Types without a dedicated decoder are treated as JSON documents.

use crate::error::{DashError, Result};
use crate::types::{ImageData, SourceValue};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Available payload decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// UTF-8 text payload
    Text,
    /// Little-endian f64
    Float64,
    /// Little-endian i64
    Int64,
    /// JSON document carrying `width`, `height`, `encoding` and `data`
    Image,
    /// Generic JSON document
    Json,
}

impl Codec {
    pub fn decode(self, bytes: &[u8]) -> Result<SourceValue> {
        match self {
            Codec::Text => std::str::from_utf8(bytes)
                .map(|s| SourceValue::Text(s.to_string()))
                .map_err(|e| DashError::Decode(format!("invalid UTF-8: {}", e))),
            Codec::Float64 => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| DashError::Decode(format!("expected 8 bytes, got {}", bytes.len())))?;
                Ok(SourceValue::Number(f64::from_le_bytes(raw)))
            }
            Codec::Int64 => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| DashError::Decode(format!("expected 8 bytes, got {}", bytes.len())))?;
                Ok(SourceValue::Number(i64::from_le_bytes(raw) as f64))
            }
            Codec::Image => {
                let doc: Value = serde_json::from_slice(bytes)?;
                decode_image(&doc).map(|img| SourceValue::Image(Arc::new(img)))
            }
            Codec::Json => {
                let doc: Value = serde_json::from_slice(bytes)?;
                Ok(SourceValue::Document(doc))
            }
        }
    }
}

fn channels_for_encoding(encoding: &str) -> Option<u8> {
    match encoding {
        "mono8" | "8UC1" => Some(1),
        "rgb8" | "bgr8" | "8UC3" => Some(3),
        "rgba8" | "bgra8" | "8UC4" => Some(4),
        _ => None,
    }
}

fn decode_image(doc: &Value) -> Result<ImageData> {
    let field = |name: &str| {
        doc.get(name)
            .ok_or_else(|| DashError::Decode(format!("image message lacks '{}'", name)))
    };
    let width = field("width")?
        .as_u64()
        .ok_or_else(|| DashError::Decode("width is not an integer".to_string()))? as u32;
    let height = field("height")?
        .as_u64()
        .ok_or_else(|| DashError::Decode("height is not an integer".to_string()))? as u32;
    let encoding = field("encoding")?.as_str().unwrap_or_default();
    let channels = channels_for_encoding(encoding)
        .ok_or_else(|| DashError::Decode(format!("unsupported encoding '{}'", encoding)))?;
    let mut pixels: Vec<u8> = serde_json::from_value(field("data")?.clone())?;

    let expected = width as usize * height as usize * channels as usize;
    if pixels.len() != expected {
        return Err(DashError::Decode(format!(
            "image data has {} bytes, expected {}",
            pixels.len(),
            expected
        )));
    }

    if encoding.starts_with("bgr") {
        for px in pixels.chunks_exact_mut(channels as usize) {
            px.swap(0, 2);
        }
    }

    Ok(ImageData {
        width,
        height,
        channels,
        pixels,
    })
}

/// Maps advertised type names to decoders
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    by_type: HashMap<String, Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut by_type = HashMap::new();
        by_type.insert("std_msgs/String".to_string(), Codec::Text);
        by_type.insert("std_msgs/Float64".to_string(), Codec::Float64);
        by_type.insert("std_msgs/Int64".to_string(), Codec::Int64);
        by_type.insert("sensor_msgs/Image".to_string(), Codec::Image);
        Self { by_type }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or override the decoder for a type name
    pub fn register(&mut self, type_name: impl Into<String>, codec: Codec) {
        self.by_type.insert(type_name.into(), codec);
    }

    /// Decoder for a type name; `pkg/msg/Type` and `pkg/Type` spellings are equivalent
    pub fn codec_for(&self, type_name: &str) -> Codec {
        let normalized = type_name.replace("/msg/", "/");
        self.by_type.get(&normalized).copied().unwrap_or(Codec::Json)
    }

    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<SourceValue> {
        self.codec_for(type_name).decode(bytes)
    }
}

/// Embedded `header.stamp` of a decoded message, in seconds
pub fn header_stamp(value: &SourceValue) -> Option<f64> {
    let SourceValue::Document(doc) = value else {
        return None;
    };
    let stamp = doc.get("header")?.get("stamp")?;
    let sec = stamp.get("sec")?.as_f64()?;
    let nanosec = stamp.get("nanosec").and_then(Value::as_f64).unwrap_or(0.0);
    Some(sec + nanosec * 1e-9)
}
