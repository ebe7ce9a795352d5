//! Source registry
//!
//! The registry maps path strings to live sources and is the single object
//! the rest of the application talks to. It owns one connector per prefix
//! and drives them through a three-phase frame:
//!
//! 1. [`SourceRegistry::begin_frame`] polls every connector once, in
//!    registration order.
//! 2. Widgets resolve paths and evaluate expressions. Every
//!    [`SourceRegistry::resolve`] marks its entry alive and creates the
//!    source through its connector on first use.
//! 3. [`SourceRegistry::end_frame`] reclaims every entry that was not
//!    resolved during the frame, running its cleanup exactly once.
//!
//! # Example
//!
//! ```ignore
//! use imdash_core::registry::SourceRegistry;
//!
//! let mut registry = SourceRegistry::new(&config, transport)?;
//! loop {
//!     registry.begin_frame();
//!     let handle = registry.resolve("/files/tmp/points.csv");
//!     if handle.changed() {
//!         redraw(handle.data());
//!     }
//!     registry.end_frame();
//! }
//! ```

pub mod selection;
pub mod source;

pub use selection::SelectionState;
pub use source::{Source, SourceHandle};

use crate::config::AppConfig;
use crate::connectors::{Connector, ConnectorKind, ConnectorTree, SourceSlot, TopicTransport};
use crate::error::{DashError, Result};
use crate::path::SourcePath;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Where the registry is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Between `end_frame` and the next `begin_frame`
    Idle,
    /// Connectors were polled; paths may be resolved
    Evaluating,
}

/// Registry entry; `source` is `None` while creation keeps failing or after
/// the connector retired the source
struct Entry {
    path: SourcePath,
    connector: usize,
    source: Option<Source>,
    alive: bool,
    last_attempt: u64,
}

/// Central map from path to source plus per-frame liveness bookkeeping
pub struct SourceRegistry {
    connectors: Vec<Box<dyn Connector>>,
    entries: BTreeMap<String, Entry>,
    phase: FramePhase,
    frame: u64,
    selection: SelectionState,
}

impl SourceRegistry {
    /// Build a registry with one connector of every kind
    pub fn new(config: &AppConfig, transport: Arc<dyn TopicTransport>) -> Result<Self> {
        let connectors = ConnectorKind::ALL
            .iter()
            .map(|kind| kind.build(config, &transport))
            .collect();
        Self::with_connectors(connectors)
    }

    /// Build a registry from explicit connectors; prefixes must be unique
    pub fn with_connectors(connectors: Vec<Box<dyn Connector>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for c in &connectors {
            if !seen.insert(c.prefix()) {
                return Err(DashError::Config(format!(
                    "Duplicate connector prefix '{}'",
                    c.prefix()
                )));
            }
        }
        tracing::debug!(
            "Source registry with connectors: {:?}",
            connectors.iter().map(|c| c.prefix()).collect::<Vec<_>>()
        );

        Ok(Self {
            connectors,
            entries: BTreeMap::new(),
            phase: FramePhase::Idle,
            frame: 0,
            selection: SelectionState::default(),
        })
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Number of frames begun so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Number of tracked paths (live or pending)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `path` currently has a live source
    pub fn contains(&self, path: &str) -> bool {
        SourcePath::parse(path)
            .ok()
            .and_then(|p| self.entries.get(p.as_str()))
            .is_some_and(|e| e.source.is_some())
    }

    /// Paths with a live source, sorted
    pub fn live_paths(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.source.is_some())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Return the source for `path`, creating it if needed, and mark it alive
    ///
    /// Unknown prefixes and failed creations yield an absent handle. A failed
    /// creation is retried at most once per frame.
    pub fn resolve(&mut self, path: &str) -> SourceHandle<'_> {
        let parsed = match SourcePath::parse(path) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!("{}", e);
                return SourceHandle::absent();
            }
        };
        let Some(connector) = self
            .connectors
            .iter()
            .position(|c| c.prefix() == parsed.prefix())
        else {
            tracing::trace!("No connector for prefix '{}'", parsed.prefix());
            return SourceHandle::absent();
        };

        let frame = self.frame;
        let entry = self
            .entries
            .entry(parsed.as_str().to_string())
            .or_insert_with(|| Entry {
                path: parsed,
                connector,
                source: None,
                alive: false,
                last_attempt: u64::MAX,
            });
        entry.alive = true;

        if entry.source.is_none() && entry.last_attempt != frame {
            entry.last_attempt = frame;
            entry.source = self.connectors[connector].create(&entry.path);
        }
        SourceHandle::new(entry.source.as_mut())
    }

    /// Let every connector refresh its sources, in registration order
    pub fn poll_all(&mut self) {
        for (idx, connector) in self.connectors.iter_mut().enumerate() {
            let mut slots: Vec<SourceSlot<'_>> = self
                .entries
                .values_mut()
                .filter(|e| e.connector == idx)
                .map(|e| SourceSlot {
                    path: &e.path,
                    source: &mut e.source,
                })
                .collect();
            connector.poll(&mut slots);
        }
    }

    /// Clean up and drop every entry not resolved since the last reclaim,
    /// then close the frame. Returns the number of entries removed.
    ///
    /// Only runs while a frame is open, so a stray call cannot reclaim
    /// entries that were merely not resolved yet.
    pub fn reclaim(&mut self) -> usize {
        if self.phase != FramePhase::Evaluating {
            tracing::debug!("reclaim() outside of a frame ignored");
            return 0;
        }

        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.alive)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &dead {
            if let Some(mut entry) = self.entries.remove(key) {
                if let Some(source) = entry.source.as_mut() {
                    source.cleanup();
                    tracing::debug!("Reclaimed {} source {}", source.kind_name(), key);
                }
            }
        }
        for entry in self.entries.values_mut() {
            entry.alive = false;
        }
        self.phase = FramePhase::Idle;
        dead.len()
    }

    /// Open a frame: poll all connectors
    pub fn begin_frame(&mut self) {
        if self.phase == FramePhase::Evaluating {
            tracing::warn!("begin_frame() without end_frame() for frame {}", self.frame);
        }
        self.frame += 1;
        self.poll_all();
        self.phase = FramePhase::Evaluating;
    }

    /// Close the frame: reclaim unused sources. Returns the number reclaimed.
    pub fn end_frame(&mut self) -> usize {
        self.reclaim()
    }

    /// Drop every source and reset every connector
    pub fn reinit(&mut self) {
        for (key, mut entry) in std::mem::take(&mut self.entries) {
            if let Some(source) = entry.source.as_mut() {
                source.cleanup();
                tracing::debug!("Released {} on reinit", key);
            }
        }
        for connector in &mut self.connectors {
            connector.cleanup();
        }
        self.phase = FramePhase::Idle;
        self.selection = SelectionState::default();
    }

    /// Browsable trees of every connector
    pub fn describe_all(&self) -> Vec<ConnectorTree> {
        self.connectors.iter().map(|c| c.describe()).collect()
    }

    /// Typed access to a connector, e.g. for transform lookups
    pub fn connector<T: Connector + 'static>(&self) -> Option<&T> {
        self.connectors
            .iter()
            .find_map(|c| c.as_any().downcast_ref::<T>())
    }

    pub fn connector_mut<T: Connector + 'static>(&mut self) -> Option<&mut T> {
        self.connectors
            .iter_mut()
            .find_map(|c| c.as_any_mut().downcast_mut::<T>())
    }

    // ==================== Selection ====================

    /// Open a path picker starting at `current`
    pub fn request_selection(&mut self, current: &str) {
        self.selection.request(current);
    }

    /// Report a chosen path; the requester consumes it with [`Self::take_selection`]
    pub fn select(&mut self, path: &str) {
        tracing::debug!("Selected {}", path);
        self.selection.select(path);
    }

    pub fn take_selection(&mut self) -> Option<String> {
        self.selection.take()
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.selection.last_selected()
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(source) = entry.source.as_mut() {
                source.cleanup();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::connectors::{FilesystemConnector, LoopbackBus, StoreConnector, TopicConnector};
    use crate::types::SourceValue;
    use tempfile::tempdir;

    fn registry(bus: &LoopbackBus, dir: &std::path::Path) -> SourceRegistry {
        let mut config = AppConfig::default();
        config.stores.shm_dir = dir.to_path_buf();
        config.filesystem.browse_root = dir.to_path_buf();
        SourceRegistry::new(&config, Arc::new(bus.clone())).unwrap()
    }

    fn file_path(dir: &std::path::Path, name: &str, content: &str) -> String {
        let file = dir.join(name);
        std::fs::write(&file, content).unwrap();
        FilesystemConnector::path_for(&file)
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let connectors: Vec<Box<dyn Connector>> = vec![
            Box::new(StoreConnector::new(&StoreConfig::default())),
            Box::new(StoreConnector::new(&StoreConfig::default())),
        ];
        assert!(SourceRegistry::with_connectors(connectors).is_err());
    }

    #[test]
    fn test_unknown_prefix_is_absent_and_untracked() {
        let bus = LoopbackBus::new();
        let dir = tempdir().unwrap();
        let mut reg = registry(&bus, dir.path());
        reg.begin_frame();
        for path in ["/nope/x", "no-slash", "", "/"] {
            let h = reg.resolve(path);
            assert!(h.is_absent());
            assert!(!h.changed());
            assert!(h.data().is_none());
        }
        assert!(reg.is_empty());
        reg.end_frame();
    }

    #[test]
    fn test_liveness_gc() {
        let bus = LoopbackBus::new();
        let dir = tempdir().unwrap();
        let a = file_path(dir.path(), "a.txt", "a");
        let b = file_path(dir.path(), "b.txt", "b");
        let mut reg = registry(&bus, dir.path());

        reg.begin_frame();
        assert_eq!(reg.resolve(&a).data(), SourceValue::Text("a".into()));
        assert!(!reg.resolve(&b).is_absent());
        assert_eq!(reg.end_frame(), 0);

        // Only `a` is resolved: `b` goes away at the end of this frame
        reg.begin_frame();
        reg.resolve(&a);
        assert_eq!(reg.end_frame(), 1);
        assert!(reg.contains(&a));
        assert!(!reg.contains(&b));

        // Nothing resolved: everything goes
        reg.begin_frame();
        assert_eq!(reg.end_frame(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reclaim_outside_frame_is_ignored() {
        let bus = LoopbackBus::new();
        let dir = tempdir().unwrap();
        let a = file_path(dir.path(), "a.txt", "a");
        let mut reg = registry(&bus, dir.path());

        reg.begin_frame();
        reg.resolve(&a);
        reg.end_frame();
        assert_eq!(reg.reclaim(), 0);
        assert!(reg.contains(&a));
    }

    #[test]
    fn test_pending_entry_created_when_file_appears() {
        let bus = LoopbackBus::new();
        let dir = tempdir().unwrap();
        let missing = dir.path().join("later.txt");
        let path = FilesystemConnector::path_for(&missing);
        let mut reg = registry(&bus, dir.path());

        reg.begin_frame();
        assert!(reg.resolve(&path).is_absent());
        reg.end_frame();
        assert!(!reg.contains(&path));

        std::fs::write(&missing, "now").unwrap();
        reg.begin_frame();
        let h = reg.resolve(&path);
        assert!(!h.is_absent());
        assert!(h.changed());
        reg.end_frame();
    }

    #[test]
    fn test_no_duplicate_subscriptions_under_churn() {
        let bus = LoopbackBus::new();
        bus.advertise("/odom", "nav_msgs/Odometry");
        let dir = tempdir().unwrap();
        let mut reg = registry(&bus, dir.path());

        for frame in 0..20 {
            reg.begin_frame();
            // Several widgets resolve the same feed, with different sub-paths on odd frames
            reg.resolve("/topics/odom");
            reg.resolve("/topics/odom");
            if frame % 2 == 1 {
                reg.resolve("/topics/odom.pose");
            }
            reg.end_frame();
            // Sub-paths share the feed's subscription
            assert_eq!(bus.subscription_count(Some("/odom")), 1);
            assert_eq!(reg.connector::<TopicConnector>().unwrap().feed_count(), 1);
        }

        reg.begin_frame();
        reg.end_frame();
        assert_eq!(bus.subscription_count(None), 0);
    }

    #[test]
    fn test_withdrawn_topic_becomes_absent() {
        let bus = LoopbackBus::new();
        bus.advertise("/a", "std_msgs/String");
        let dir = tempdir().unwrap();
        let mut reg = registry(&bus, dir.path());

        reg.begin_frame();
        assert!(!reg.resolve("/topics/a").is_absent());
        reg.end_frame();

        bus.withdraw("/a");
        reg.begin_frame();
        assert!(reg.resolve("/topics/a").is_absent());
        reg.end_frame();
        assert_eq!(bus.subscription_count(None), 0);
    }

    #[test]
    fn test_typed_connector_access_and_reinit() {
        let bus = LoopbackBus::new();
        bus.advertise("/a", "std_msgs/String");
        let dir = tempdir().unwrap();
        let mut reg = registry(&bus, dir.path());

        assert!(reg.connector::<TopicConnector>().is_some());
        assert!(reg.connector_mut::<FilesystemConnector>().is_some());
        let topics = reg.connector::<TopicConnector>().unwrap();
        assert!(topics.lookup_transform("map", "base", 0.0).is_none());

        reg.begin_frame();
        reg.resolve("/topics/a");
        reg.end_frame();
        reg.reinit();
        assert!(reg.is_empty());
        assert_eq!(bus.subscription_count(None), 0);
        assert_eq!(reg.phase(), FramePhase::Idle);
    }

    #[test]
    fn test_describe_all_covers_every_connector() {
        let bus = LoopbackBus::new();
        let dir = tempdir().unwrap();
        let reg = registry(&bus, dir.path());
        let trees = reg.describe_all();
        assert_eq!(trees.len(), ConnectorKind::ALL.len());
        assert_eq!(trees[1].label, "topics");
    }

    #[test]
    fn test_selection_roundtrip() {
        let bus = LoopbackBus::new();
        let dir = tempdir().unwrap();
        let mut reg = registry(&bus, dir.path());
        reg.request_selection("/topics/odom");
        assert_eq!(reg.selection().requested(), Some("/topics/odom"));
        reg.select("/stores/s/x");
        assert_eq!(reg.take_selection().as_deref(), Some("/stores/s/x"));
        assert_eq!(reg.take_selection(), None);
        assert_eq!(reg.last_selected(), Some("/stores/s/x"));
    }
}
