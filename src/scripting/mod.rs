//! Bound expressions
//!
//! An expression is a small piece of Rhai text that may embed one source
//! reference in braces:
//!
//! ```text
//! {/topics/odom.pose.pose.position.x}
//! 5 * {/files/home/me/run/points.csv}
//! mean({/stores/robot_state/joints/effort}) + alt
//! ```
//!
//! The first `{/...}` token is the bound path. It is replaced by the
//! identifier `src`, which holds the source's data when the expression is
//! evaluated; `alt` always holds the literal fallback. Expressions without a
//! token, or in literal mode, evaluate to the fallback.
//!
//! ## Available Functions
//!
//! Only numeric and array helpers are registered; there is no access to the
//! environment or the filesystem, and `eval` is disabled.
//!
//! - math: `abs`, `sqrt`, `pow`, `exp`, `ln`, `log10`, `sin`, `cos`, `atan2`, ...
//! - rounding and limits: `floor`, `ceil`, `round`, `clamp`, `min`, `max`
//! - arrays: `sum`, `mean`, `std`, `min`, `max`, `norm`, `flatten`, `linspace`
//! - elementwise `+ - * /` between a number and an array
//!
//! ## Example
//!
//! ```ignore
//! use imdash_core::scripting::{Expression, ExpressionEngine};
//!
//! let engine = ExpressionEngine::default();
//! let mut expr = Expression::bound("5 * {/stores/state/gain}");
//! registry.begin_frame();
//! let value = expr.evaluate(&engine, &mut registry)?;
//! registry.end_frame();
//! ```

mod engine;
pub mod expression;

pub use engine::ExpressionEngine;
pub use expression::{Expression, ExpressionState, ParsedExpression};

use crate::error::{DashError, Result};
use rhai::{Engine, AST};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A compiled host expression
#[derive(Clone)]
pub struct CompiledExpression {
    ast: Arc<AST>,
    host: String,
}

impl CompiledExpression {
    /// Host text the expression was compiled from (token already replaced)
    pub fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("host", &self.host)
            .finish()
    }
}

/// Cache of compiled host expressions, keyed by host text
///
/// Widgets evaluate the same text every frame, so compilation happens once
/// per distinct text. When the cache is full it is emptied.
#[derive(Default)]
pub struct ExpressionCache {
    cache: HashMap<String, CompiledExpression>,
    capacity: usize,
}

impl ExpressionCache {
    /// Create an empty cache holding at most `capacity` entries (0 = unbounded)
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity,
        }
    }

    /// Get a cached expression or compile and cache it
    pub fn get_or_compile(&mut self, engine: &Engine, host: &str) -> Result<CompiledExpression> {
        if let Some(compiled) = self.cache.get(host) {
            return Ok(compiled.clone());
        }

        let ast = engine
            .compile_expression(host)
            .map_err(|e| DashError::Script(format!("Compilation error in '{}': {}", host, e)))?;

        let compiled = CompiledExpression {
            ast: Arc::new(ast),
            host: host.to_string(),
        };

        if self.capacity > 0 && self.cache.len() >= self.capacity {
            tracing::debug!("Expression cache full ({} entries), clearing", self.cache.len());
            self.cache.clear();
        }
        self.cache.insert(host.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Remove a specific host text from the cache
    pub fn invalidate(&mut self, host: &str) {
        self.cache.remove(host);
    }
}

/// Thread-safe expression cache wrapper
pub type SharedExpressionCache = Arc<RwLock<ExpressionCache>>;

/// Create a new shared expression cache
pub fn create_shared_cache(capacity: usize) -> SharedExpressionCache {
    Arc::new(RwLock::new(ExpressionCache::new(capacity)))
}
