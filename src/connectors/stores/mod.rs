//! Shared structured store connector (`/stores/...`)
//!
//! Paths have the form `/stores/<store name>/<sub path>`, e.g.
//! `/stores/robot_state/pose/position`. Store names are resolved against the
//! configured shared-memory directory. One [`SharedStore`] handle is opened
//! per store name and shared by every source reading from it; handles that
//! no live source references are closed at the end of each poll.

pub mod store;

pub use store::SharedStore;

use super::{Connector, ConnectorTree, SourceSlot};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::path::{SourcePath, SubPath};
use crate::registry::Source;
use crate::types::SourceValue;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Path prefix owned by this connector
pub const PREFIX: &str = "stores";

/// Split `/<name>/<sub path>` into the store name and the sub-path
fn split_remainder(remainder: &str) -> Option<(&str, Result<SubPath>)> {
    let rest = remainder.strip_prefix('/')?;
    let (name, sub) = rest.split_once('/').unwrap_or((rest, ""));
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, SubPath::parse(sub)))
}

/// Source reading one sub-path of a shared store
pub struct StoreSource {
    store_name: String,
    sub_path: SubPath,
    store: Arc<SharedStore>,
    snapshot: SourceValue,
    last_sequence: u64,
    changed: bool,
    change_requested: bool,
    last_update: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl StoreSource {
    fn new(store: Arc<SharedStore>, sub_path: SubPath) -> Result<Self> {
        let value = store.read(&sub_path)?;
        Ok(Self {
            store_name: store.name().to_string(),
            last_sequence: store.sequence(),
            store,
            sub_path,
            snapshot: SourceValue::Document(value),
            changed: true,
            change_requested: false,
            last_update: Some(Utc::now()),
            error: None,
        })
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn sub_path(&self) -> &SubPath {
        &self.sub_path
    }

    /// Re-read after the store was revalidated. Writes elsewhere in the
    /// store advance the sequence but only mark this source changed when
    /// its own value differs.
    fn refresh(&mut self) {
        self.changed = std::mem::take(&mut self.change_requested);

        let sequence = self.store.sequence();
        if sequence == self.last_sequence {
            return;
        }
        match self.store.read(&self.sub_path) {
            Ok(value) => {
                self.last_sequence = sequence;
                self.error = None;
                let value = SourceValue::Document(value);
                if value != self.snapshot {
                    self.snapshot = value;
                    self.changed = true;
                    self.last_update = Some(Utc::now());
                }
            }
            Err(e) => {
                if self.error.is_none() {
                    tracing::debug!(
                        "Failed to read {}/{}: {}",
                        self.store_name,
                        self.sub_path,
                        e
                    );
                }
                self.error = Some(e.to_string());
            }
        }
    }

    /// Live read through the lock chain, or the last snapshot if the store is unavailable
    pub fn data(&self) -> SourceValue {
        match self.store.read(&self.sub_path) {
            Ok(value) => SourceValue::Document(value),
            Err(_) => self.snapshot.clone(),
        }
    }

    /// Replace the value at this source's sub-path
    pub fn write(&mut self, value: &Value) -> Result<()> {
        self.store.write(&self.sub_path, value.clone())?;
        self.snapshot = SourceValue::Document(value.clone());
        self.last_sequence = self.store.sequence();
        self.last_update = Some(Utc::now());
        self.change_requested = true;
        Ok(())
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

    /// The store handle belongs to the connector's cache and is closed there
    pub fn cleanup(&mut self) {}
}

/// Connector for shared structured stores
pub struct StoreConnector {
    shm_dir: PathBuf,
    stores: HashMap<String, Arc<SharedStore>>,
}

impl StoreConnector {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            shm_dir: config.shm_dir.clone(),
            stores: HashMap::new(),
        }
    }

    /// Names of the currently opened stores
    pub fn open_stores(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn store(&mut self, name: &str) -> Result<Arc<SharedStore>> {
        if let Some(store) = self.stores.get(name) {
            return Ok(store.clone());
        }
        let store = Arc::new(SharedStore::open(&self.shm_dir, name)?);
        self.stores.insert(name.to_string(), store.clone());
        Ok(store)
    }
}

impl Connector for StoreConnector {
    fn prefix(&self) -> &'static str {
        PREFIX
    }

    fn create(&mut self, path: &SourcePath) -> Option<Source> {
        let (name, sub_path) = split_remainder(path.remainder())?;
        let sub_path = match sub_path {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("Bad sub-path in {}: {}", path, e);
                return None;
            }
        };

        let source = self
            .store(name)
            .and_then(|store| StoreSource::new(store, sub_path));
        match source {
            Ok(source) => {
                tracing::debug!("Created store source {}", path);
                Some(Source::Store(source))
            }
            Err(e) => {
                tracing::trace!("Cannot open {}: {}", path, e);
                None
            }
        }
    }

    fn poll(&mut self, sources: &mut [SourceSlot<'_>]) {
        // Each store is revalidated once per poll; the outcome applies to all its sources
        let mut revalidated: HashMap<String, Option<String>> = HashMap::new();

        for slot in sources.iter_mut() {
            let Some(Source::Store(source)) = slot.source.as_mut() else {
                continue;
            };
            let failure = revalidated
                .entry(source.store_name().to_string())
                .or_insert_with(|| match source.store.revalidate() {
                    Ok(_) => None,
                    Err(e) => {
                        tracing::trace!("Revalidating {} failed: {}", source.store_name, e);
                        Some(e.to_string())
                    }
                })
                .clone();
            match failure {
                None => source.refresh(),
                Some(e) => {
                    source.changed = std::mem::take(&mut source.change_requested);
                    source.error = Some(e);
                }
            }
        }
        let used: HashSet<&String> = revalidated.keys().collect();

        self.stores.retain(|name, store| {
            let keep = used.contains(name);
            if !keep {
                store.close();
            }
            keep
        });
    }

    /// Files in the shared-memory directory that carry the store magic
    fn describe(&self) -> ConnectorTree {
        let mut root = ConnectorTree::branch(PREFIX);
        let Ok(entries) = std::fs::read_dir(&self.shm_dir) else {
            return root;
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| store::is_store_file(&e.path()))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        root.children = names
            .into_iter()
            .map(|name| {
                let path = format!("/{}/{}", PREFIX, name);
                ConnectorTree::leaf(name, path)
            })
            .collect();
        root
    }

    fn cleanup(&mut self) {
        for store in self.stores.values() {
            store.close();
        }
        self.stores.clear();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
