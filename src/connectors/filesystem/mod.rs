//! Filesystem connector (`/files/...`)
//!
//! The remainder of a path is an absolute file path:
//! `/files/home/me/run/points.csv` refers to `/home/me/run/points.csv`.
//! Files are loaded on creation and reloaded whenever their modification
//! time increases. A reload that fails (file removed, half written,
//! unreadable) keeps the previous snapshot.

pub mod loaders;

pub use loaders::load_file;

use super::{Connector, ConnectorTree, SourceSlot};
use crate::config::FilesystemConfig;
use crate::path::SourcePath;
use crate::registry::Source;
use crate::types::SourceValue;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Path prefix owned by this connector
pub const PREFIX: &str = "files";

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

/// Source backed by a file on disk
#[derive(Debug)]
pub struct FileSource {
    file_path: PathBuf,
    data: SourceValue,
    mod_time: SystemTime,
    changed: bool,
    change_requested: bool,
    last_update: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl FileSource {
    /// Load `file_path` now; fails if the file cannot be read or decoded
    pub fn open(file_path: impl Into<PathBuf>) -> crate::error::Result<Self> {
        let file_path = file_path.into();
        let mod_time = modified(&file_path)?;
        let data = load_file(&file_path)?;
        Ok(Self {
            file_path,
            data,
            mod_time,
            changed: true,
            change_requested: false,
            last_update: Some(Utc::now()),
            error: None,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Reload if the modification time increased
    pub fn refresh(&mut self) {
        self.changed = std::mem::take(&mut self.change_requested);

        let mtime = match modified(&self.file_path) {
            Ok(t) => t,
            Err(e) => {
                if self.error.is_none() {
                    tracing::debug!("{:?} is unavailable, keeping last snapshot: {}", self.file_path, e);
                }
                self.error = Some(e.to_string());
                return;
            }
        };
        if mtime <= self.mod_time {
            return;
        }

        match load_file(&self.file_path) {
            Ok(data) => {
                tracing::trace!("Reloaded {:?}", self.file_path);
                self.data = data;
                self.mod_time = mtime;
                self.changed = true;
                self.last_update = Some(Utc::now());
                self.error = None;
            }
            Err(e) => {
                if self.error.is_none() {
                    tracing::debug!("Failed to reload {:?}: {}", self.file_path, e);
                }
                self.error = Some(e.to_string());
            }
        }
    }

    pub fn data(&self) -> SourceValue {
        self.data.clone()
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn request_changed(&mut self) {
        self.change_requested = true;
    }

    pub fn cleanup(&mut self) {}
}

/// Connector for files on the local filesystem
pub struct FilesystemConnector {
    browse_root: PathBuf,
    show_hidden: bool,
}

impl FilesystemConnector {
    pub fn new(config: &FilesystemConfig) -> Self {
        Self {
            browse_root: config.browse_root.clone(),
            show_hidden: config.show_hidden,
        }
    }

    pub fn browse_root(&self) -> &Path {
        &self.browse_root
    }

    pub fn set_browse_root(&mut self, root: impl Into<PathBuf>) {
        self.browse_root = root.into();
    }

    pub fn set_show_hidden(&mut self, show: bool) {
        self.show_hidden = show;
    }

    /// Source path for a file on disk
    pub fn path_for(file: &Path) -> String {
        format!("/{}{}", PREFIX, file.display())
    }

    fn list_dir(&self, dir: &Path) -> Vec<(String, PathBuf, bool)> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot list {:?}: {}", dir, e);
                return Vec::new();
            }
        };
        let mut out: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if !self.show_hidden && name.starts_with('.') {
                    return None;
                }
                let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                Some((name, e.path(), is_dir))
            })
            .collect();
        out.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        out
    }
}

impl Connector for FilesystemConnector {
    fn prefix(&self) -> &'static str {
        PREFIX
    }

    fn create(&mut self, path: &SourcePath) -> Option<Source> {
        let remainder = path.remainder();
        if remainder.len() <= 1 {
            return None;
        }
        match FileSource::open(remainder) {
            Ok(source) => {
                tracing::debug!("Created file source {} ({})", path, source.data);
                Some(Source::File(source))
            }
            Err(e) => {
                tracing::trace!("Cannot load {}: {}", path, e);
                None
            }
        }
    }

    fn poll(&mut self, sources: &mut [SourceSlot<'_>]) {
        for slot in sources.iter_mut() {
            if let Some(Source::File(source)) = slot.source.as_mut() {
                source.refresh();
            }
        }
    }

    /// Entries of the browse root; directories are listed one level deep
    fn describe(&self) -> ConnectorTree {
        let mut root = ConnectorTree::branch(self.browse_root.display().to_string());
        for (name, path, is_dir) in self.list_dir(&self.browse_root) {
            if is_dir {
                let mut branch = ConnectorTree::branch(name);
                branch.children = self
                    .list_dir(&path)
                    .into_iter()
                    .filter(|(_, _, is_dir)| !is_dir)
                    .map(|(name, path, _)| ConnectorTree::leaf(name, Self::path_for(&path)))
                    .collect();
                root.children.push(branch);
            } else {
                root.children.push(ConnectorTree::leaf(name, Self::path_for(&path)));
            }
        }
        root
    }

    fn cleanup(&mut self) {}

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
