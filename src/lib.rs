//! # imdash-core: live data sources for dashboards
//!
//! A dashboard binds visual widgets to live data through small expressions
//! such as `5 * {/topics/odom.pose.pose.position.x}`. This crate implements
//! everything below the widgets: mapping path strings to live sources,
//! keeping those sources fresh, reclaiming them when nothing uses them, and
//! evaluating the expressions.
//!
//! ## Architecture
//!
//! - **Registry**: [`SourceRegistry`] maps paths to sources and drives the
//!   per-frame poll / resolve / reclaim cycle
//! - **Connectors**: one per path prefix
//!   - `files`: files on disk, reloaded when their modification time changes
//!   - `topics`: publish/subscribe feeds, serviced by background producers
//!     through capacity-one latest-value slots
//!   - `stores`: shared-memory structured stores with per-node lock chains
//! - **Scripting**: Rhai-based [`Expression`]s with one `{path}` reference
//!
//! ## Configuration
//!
//! Runtime configuration is stored in the platform data directory under
//! `imdash` (see [`config`]).
//!
//! ## Example
//!
//! ```ignore
//! use imdash_core::{AppConfig, Expression, ExpressionEngine, LoopbackBus, SourceRegistry};
//! use std::sync::Arc;
//!
//! let config = AppConfig::load_or_default();
//! let mut registry = SourceRegistry::new(&config, Arc::new(LoopbackBus::new()))?;
//! let engine = ExpressionEngine::new(&config.scripting);
//! let mut speed = Expression::bound("3.6 * {/topics/odom.twist.twist.linear.x}");
//!
//! loop {
//!     registry.begin_frame();
//!     if speed.is_stale(&mut registry) {
//!         println!("{:?}", speed.evaluate(&engine, &mut registry));
//!     }
//!     registry.end_frame();
//! }
//! ```

pub mod config;
pub mod connectors;
pub mod error;
pub mod path;
pub mod registry;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, DashboardFile};
pub use connectors::{Connector, ConnectorKind, ConnectorTree, LoopbackBus, SharedStore, TopicTransport};
pub use error::{DashError, Result};
pub use path::{SourcePath, SubPath};
pub use registry::{FramePhase, Source, SourceHandle, SourceRegistry};
pub use scripting::{Expression, ExpressionEngine};
pub use types::SourceValue;
