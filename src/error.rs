//! Error handling for imdash-core
//!
//! This module defines the error type shared by the registry, the
//! connectors and the expression engine, plus a Result alias.
//!
//! Connectors never hand these errors out of `poll`; they record them on the
//! affected source instead. Only expression evaluation and explicit store
//! operations return them to the caller.

use thiserror::Error;

/// Main error type for imdash-core operations
#[derive(Error, Debug)]
pub enum DashError {
    /// Errors related to expression compilation or evaluation
    #[error("Script error: {0}")]
    Script(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// A path string that cannot be mapped to a connector
    #[error("Invalid path: {0}")]
    Path(String),

    /// The bound source is absent (unknown prefix, not yet created, or failed)
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The bound source cannot accept writes
    #[error("Source is read-only: {0}")]
    NotWritable(String),

    /// Errors related to shared structured stores
    #[error("Store error: {0}")]
    Store(String),

    /// Errors related to the topic transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Errors decoding file contents or topic payloads
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<DashError>,
    },
}

impl DashError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        DashError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        DashError::Script(err.to_string())
    }
}

impl From<serde_json::Error> for DashError {
    fn from(err: serde_json::Error) -> Self {
        DashError::Serialization(err.to_string())
    }
}

/// Result type alias for imdash-core operations
pub type Result<T> = std::result::Result<T, DashError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| DashError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DashError::from_rhai_error(e).with_context(f()))
    }
}
