//! Source variants and the handle returned by resolution

use crate::connectors::{FileSource, StoreSource, TopicSource};
use crate::error::{DashError, Result};
use crate::types::SourceValue;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The live backing object for one resolved path
pub enum Source {
    File(FileSource),
    Topic(TopicSource),
    Store(StoreSource),
}

impl Source {
    /// Current data snapshot
    pub fn data(&self) -> SourceValue {
        match self {
            Source::File(s) => s.data(),
            Source::Topic(s) => s.data(),
            Source::Store(s) => s.data(),
        }
    }

    /// Whether the last refresh produced a new value
    pub fn changed(&self) -> bool {
        match self {
            Source::File(s) => s.changed(),
            Source::Topic(s) => s.changed(),
            Source::Store(s) => s.changed(),
        }
    }

    /// Wall time of the last successful refresh
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        match self {
            Source::File(s) => s.last_update(),
            Source::Topic(s) => s.last_update(),
            Source::Store(s) => s.last_update(),
        }
    }

    /// Last refresh failure, if the source is currently running on a retained snapshot
    pub fn error(&self) -> Option<&str> {
        match self {
            Source::File(s) => s.error(),
            Source::Topic(s) => s.error(),
            Source::Store(s) => s.error(),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Source::Store(_))
    }

    /// Replace the value behind this source. Only store sources accept writes.
    pub fn write(&mut self, value: &Value) -> Result<()> {
        match self {
            Source::Store(s) => s.write(value),
            Source::File(s) => Err(DashError::NotWritable(s.file_path().display().to_string())),
            Source::Topic(s) => Err(DashError::NotWritable(s.topic().to_string())),
        }
    }

    /// Ask the connector to report this source as changed on the next poll
    pub fn request_changed(&mut self) {
        match self {
            Source::File(s) => s.request_changed(),
            Source::Topic(s) => s.request_changed(),
            Source::Store(s) => s.request_changed(),
        }
    }

    /// Release owned resources. Idempotent.
    pub fn cleanup(&mut self) {
        match self {
            Source::File(s) => s.cleanup(),
            Source::Topic(s) => s.cleanup(),
            Source::Store(s) => s.cleanup(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Source::File(_) => "file",
            Source::Topic(_) => "topic",
            Source::Store(_) => "store",
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("kind", &self.kind_name())
            .field("changed", &self.changed())
            .field("last_update", &self.last_update())
            .finish()
    }
}

/// Result of resolving a path: either a live source or "absent"
///
/// Absent handles report no data and never report a change.
pub struct SourceHandle<'a> {
    source: Option<&'a mut Source>,
}

impl<'a> SourceHandle<'a> {
    pub(crate) fn new(source: Option<&'a mut Source>) -> Self {
        Self { source }
    }

    pub fn absent() -> Self {
        Self { source: None }
    }

    pub fn is_absent(&self) -> bool {
        self.source.is_none()
    }

    pub fn data(&self) -> SourceValue {
        self.source.as_ref().map(|s| s.data()).unwrap_or_default()
    }

    pub fn changed(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.changed())
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.source.as_ref().and_then(|s| s.last_update())
    }

    pub fn error(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.error())
    }

    pub fn is_writable(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_writable())
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_deref()
    }

    pub fn source_mut(&mut self) -> Option<&mut Source> {
        self.source.as_deref_mut()
    }
}
