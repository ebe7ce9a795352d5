//! Source path and sub-path addressing
//!
//! A source path has the shape `/<prefix><remainder>`: the first segment
//! selects the connector (`files`, `topics`, `stores`), the remainder is
//! interpreted by that connector. Structured values are addressed with a
//! dotted/bracketed sub-path such as `pose.position[2]` or `a/b/0`.

use crate::error::{DashError, Result};
use serde_json::Value;
use std::fmt;

/// A parsed source path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePath {
    raw: String,
    prefix_end: usize,
}

impl SourcePath {
    /// Parse a path of the form `/<prefix>/<remainder>`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| DashError::Path(format!("'{}' does not start with '/'", raw)))?;

        let prefix_len = rest.find('/').unwrap_or(rest.len());
        if prefix_len == 0 {
            return Err(DashError::Path(format!("'{}' has an empty prefix", raw)));
        }

        Ok(Self {
            raw: raw.to_string(),
            prefix_end: prefix_len + 1,
        })
    }

    /// The full path text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The connector prefix without slashes (e.g. `files`)
    pub fn prefix(&self) -> &str {
        &self.raw[1..self.prefix_end]
    }

    /// Everything after the prefix, including the leading `/` (may be empty)
    pub fn remainder(&self) -> &str {
        &self.raw[self.prefix_end..]
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One step of a sub-path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    /// Array index for this segment; numeric keys count as indices
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(k) => k.parse().ok(),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A path into a structured value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubPath(Vec<PathSegment>);

impl SubPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    /// Parse dotted, slashed and bracketed notation: `a.b[2]`, `/a/b/2`, `[0].x`
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = text.trim().chars();

        fn flush(current: &mut String, segments: &mut Vec<PathSegment>) {
            if !current.is_empty() {
                segments.push(PathSegment::Key(std::mem::take(current)));
            }
        }

        while let Some(c) = chars.next() {
            match c {
                '.' | '/' => flush(&mut current, &mut segments),
                '[' => {
                    flush(&mut current, &mut segments);
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(DashError::Path(format!("unterminated '[' in '{}'", text)));
                    }
                    let inner = inner.trim().trim_matches(|c| c == '"' || c == '\'');
                    match inner.parse::<usize>() {
                        Ok(i) => segments.push(PathSegment::Index(i)),
                        Err(_) => segments.push(PathSegment::Key(inner.to_string())),
                    }
                }
                c => current.push(c),
            }
        }
        flush(&mut current, &mut segments);

        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Split into (parent path, final segment)
    pub fn split_last(&self) -> Option<(&[PathSegment], &PathSegment)> {
        self.0.split_last().map(|(last, parent)| (parent, last))
    }

    /// Follow this path through a JSON document
    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(value, |v, seg| match v {
            Value::Object(map) => match seg {
                PathSegment::Key(k) => map.get(k),
                PathSegment::Index(i) => map.get(&i.to_string()),
            },
            Value::Array(items) => seg.as_index().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl fmt::Display for SubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                PathSegment::Key(k) if i > 0 => write!(f, ".{}", k)?,
                seg => write!(f, "{}", seg)?,
            }
        }
        Ok(())
    }
}
