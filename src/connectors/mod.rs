//! Connectors: the owners of path-prefix namespaces
//!
//! A connector creates, refreshes and retires the sources whose paths fall
//! under its prefix. The set of connector kinds is fixed at compile time:
//! [`ConnectorKind`] lists every variant together with its prefix and the
//! factory that builds it.
//!
//! # Contract
//!
//! - [`Connector::create`] is called on the first resolution of an unknown
//!   path. It must fail fast; `None` means "absent for now, retry later".
//! - [`Connector::poll`] runs once per frame and must finish in bounded time.
//!   It never returns errors: failures are recorded on the affected source
//!   and the last good snapshot is kept.
//! - A connector may retire a source whose backing resource vanished by
//!   cleaning it up and clearing its slot; the path then goes back to absent.

pub mod filesystem;
pub mod stores;
pub mod topics;

pub use filesystem::{FileSource, FilesystemConnector};
pub use stores::{SharedStore, StoreConnector, StoreSource};
pub use topics::{LoopbackBus, TopicConnector, TopicSource, TopicTransport};

use crate::config::AppConfig;
use crate::path::SourcePath;
use crate::registry::Source;
use serde::Serialize;
use std::sync::Arc;

/// A registry entry handed to its connector during a poll
pub struct SourceSlot<'a> {
    pub path: &'a SourcePath,
    pub source: &'a mut Option<Source>,
}

/// Browsable description of what a connector can offer, for path pickers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectorTree {
    pub label: String,
    /// Full source path when this node is selectable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConnectorTree>,
}

impl ConnectorTree {
    pub fn branch(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn leaf(label: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: Some(path.into()),
            children: Vec::new(),
        }
    }

    /// Every selectable path in this tree, depth first
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(p) = &self.path {
            out.push(p.as_str());
        }
        for child in &self.children {
            out.extend(child.paths());
        }
        out
    }
}

/// Capabilities every connector provides
pub trait Connector: Send {
    /// The path prefix this connector owns, without slashes
    fn prefix(&self) -> &'static str;

    /// Try to create the source for a path under this prefix
    fn create(&mut self, path: &SourcePath) -> Option<Source>;

    /// Refresh every source under this prefix (non-blocking)
    fn poll(&mut self, sources: &mut [SourceSlot<'_>]);

    /// Describe the selectable paths
    fn describe(&self) -> ConnectorTree;

    /// Release connector-wide resources (called on re-initialisation)
    fn cleanup(&mut self);

    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Static list of connector variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Files,
    Topics,
    Stores,
}

impl ConnectorKind {
    pub const ALL: [ConnectorKind; 3] = [
        ConnectorKind::Files,
        ConnectorKind::Topics,
        ConnectorKind::Stores,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ConnectorKind::Files => filesystem::PREFIX,
            ConnectorKind::Topics => topics::PREFIX,
            ConnectorKind::Stores => stores::PREFIX,
        }
    }

    /// Build the connector for this variant
    pub fn build(self, config: &AppConfig, transport: &Arc<dyn TopicTransport>) -> Box<dyn Connector> {
        match self {
            ConnectorKind::Files => Box::new(FilesystemConnector::new(&config.filesystem)),
            ConnectorKind::Topics => Box::new(TopicConnector::new(transport.clone(), &config.topics)),
            ConnectorKind::Stores => Box::new(StoreConnector::new(&config.stores)),
        }
    }
}
