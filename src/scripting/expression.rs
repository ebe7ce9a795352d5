//! Expressions bound to a source path
//!
//! An [`Expression`] is in one of two modes:
//!
//! - **literal**: evaluates to its fallback value, which a widget edits
//!   directly;
//! - **bound**: the text is evaluated with the first `{/...}` token
//!   replaced by the bound source's data.
//!
//! Every operation that looks at the bound source goes through
//! [`SourceRegistry::resolve`], so an expression that is evaluated or
//! checked for staleness keeps its source alive for the current frame.

use super::ExpressionEngine;
use crate::error::{DashError, Result, ResultExt};
use crate::registry::SourceRegistry;
use crate::types::{dynamic_to_json, json_to_dynamic};
use rhai::Dynamic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

/// Identifier the bound token is replaced with
pub const SOURCE_VAR: &str = "src";
/// Identifier holding the literal fallback
pub const FALLBACK_VAR: &str = "alt";

const FILES_TOKEN_PREFIX: &str = "{/files/";

/// Location and contents of the first `{/...}` token
fn find_token(text: &str) -> Option<(Range<usize>, &str)> {
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        let len = text[start + 1..].find('}')?;
        let inner = &text[start + 1..start + 1 + len];
        if inner.starts_with('/') && inner.len() > 1 {
            return Some((start..start + len + 2, inner));
        }
        from = start + 1;
    }
    None
}

/// Result of splitting expression text into its bound path and host text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedExpression {
    /// Path of the first token, if any
    pub bound_path: Option<String>,
    /// Text with the token replaced by [`SOURCE_VAR`]
    pub host: String,
}

impl ParsedExpression {
    pub fn parse(text: &str) -> Self {
        match find_token(text) {
            Some((range, path)) => Self {
                bound_path: Some(path.to_string()),
                host: format!("{}{}{}", &text[..range.start], SOURCE_VAR, &text[range.end..]),
            },
            None => Self {
                bound_path: None,
                host: text.to_string(),
            },
        }
    }

    /// Whether the host text is the bare source, i.e. the text was just `{path}`
    pub fn is_passthrough(&self) -> bool {
        self.bound_path.is_some() && self.host.trim() == SOURCE_VAR
    }
}

/// Lexically normalize an absolute path (`.` and `..` resolved)
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `target` expressed relative to `base`; both are absolute
fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target = normalize(target);
    let base = normalize(base);
    let t: Vec<_> = target.components().collect();
    let b: Vec<_> = base.components().collect();
    let common = t.iter().zip(&b).take_while(|(x, y)| x == y).count();

    let mut out = PathBuf::new();
    for _ in common..b.len() {
        out.push("..");
    }
    for c in &t[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Rewrite the file part of every `{/files/...}` token with `f`
fn rewrite_file_tokens(text: &str, f: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(FILES_TOKEN_PREFIX) {
        let body_start = start + FILES_TOKEN_PREFIX.len();
        let Some(len) = rest[body_start..].find('}') else {
            break;
        };
        out.push_str(&rest[..body_start]);
        out.push_str(&f(&rest[body_start..body_start + len]));
        out.push('}');
        rest = &rest[body_start + len + 1..];
    }
    out.push_str(rest);
    out
}

/// Persisted form of an [`Expression`]
///
/// File tokens are stored relative to the directory the state is saved
/// from. The fallback is only stored for literal-mode expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionState {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub use_expr: bool,
    #[serde(default = "default_allow_expr")]
    pub allow_expr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

fn default_allow_expr() -> bool {
    true
}

/// An expression bound to at most one source path
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    fallback: Value,
    use_expr: bool,
    allow_expr: bool,
    evaluated: bool,
}

impl Default for Expression {
    fn default() -> Self {
        Self::literal(Value::Null)
    }
}

impl Expression {
    /// Bound-mode expression from text such as `2 * {/topics/speed}`
    pub fn bound(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fallback: Value::Null,
            use_expr: true,
            allow_expr: true,
            evaluated: false,
        }
    }

    /// Literal-mode expression that can later be switched to bound mode
    pub fn literal(fallback: impl Into<Value>) -> Self {
        Self {
            text: String::new(),
            fallback: fallback.into(),
            use_expr: false,
            allow_expr: true,
            evaluated: false,
        }
    }

    /// Literal value that can never be bound (colors, output paths)
    pub fn fixed(value: impl Into<Value>) -> Self {
        Self {
            allow_expr: false,
            ..Self::literal(value)
        }
    }

    /// Bound-mode expression with a fallback available through `alt`
    pub fn with_fallback(text: impl Into<String>, fallback: impl Into<Value>) -> Self {
        Self {
            fallback: fallback.into(),
            ..Self::bound(text)
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.evaluated = false;
    }

    pub fn fallback(&self) -> &Value {
        &self.fallback
    }

    pub fn use_expr(&self) -> bool {
        self.use_expr
    }

    pub fn allow_expr(&self) -> bool {
        self.allow_expr
    }

    /// Switch between literal and bound mode; fixed expressions stay literal
    pub fn set_use_expr(&mut self, use_expr: bool) {
        self.use_expr = use_expr && self.allow_expr;
        self.evaluated = false;
    }

    pub fn parse(&self) -> ParsedExpression {
        ParsedExpression::parse(&self.text)
    }

    /// Path of the first token while in bound mode
    pub fn bound_path(&self) -> Option<String> {
        if !self.use_expr {
            return None;
        }
        find_token(&self.text).map(|(_, path)| path.to_string())
    }

    /// Path a write would go to: the text must be exactly one token
    fn write_path(&self) -> Option<&str> {
        let text = self.text.trim();
        match find_token(text) {
            Some((range, path)) if range.start == 0 && range.end == text.len() => Some(path),
            _ => None,
        }
    }

    /// Evaluate against the current frame's sources
    ///
    /// Unbound expressions yield the fallback. A bound source that is
    /// absent yields [`DashError::SourceUnavailable`].
    pub fn evaluate(
        &mut self,
        engine: &ExpressionEngine,
        registry: &mut SourceRegistry,
    ) -> Result<Dynamic> {
        self.evaluated = true;
        let alt = json_to_dynamic(&self.fallback);

        let parsed = self.parse();
        let Some(path) = parsed.bound_path.as_deref().filter(|_| self.use_expr) else {
            return Ok(alt);
        };

        let handle = registry.resolve(path);
        if handle.is_absent() {
            return Err(DashError::SourceUnavailable(path.to_string()));
        }
        let data = handle.data().to_dynamic();

        if parsed.is_passthrough() {
            return Ok(data);
        }
        let compiled = engine.compile(&parsed.host)?;
        engine
            .execute(&compiled, data, alt)
            .with_context(|| format!("Evaluating '{}'", self.text))
    }

    /// [`Self::evaluate`] converted to JSON
    pub fn evaluate_json(
        &mut self,
        engine: &ExpressionEngine,
        registry: &mut SourceRegistry,
    ) -> Result<Value> {
        let value = self.evaluate(engine, registry)?;
        dynamic_to_json(&value)
    }

    /// Whether the value may have changed since the last evaluation
    pub fn is_stale(&self, registry: &mut SourceRegistry) -> bool {
        match self.bound_path() {
            Some(path) => registry.resolve(&path).changed(),
            None => !self.evaluated,
        }
    }

    /// Whether a write would reach a source
    pub fn is_read_write(&self, registry: &mut SourceRegistry) -> bool {
        if !self.use_expr {
            return true;
        }
        self.write_path()
            .is_some_and(|path| registry.resolve(path).is_writable())
    }

    /// Write `value` through the bound source, or replace the fallback in
    /// literal mode
    ///
    /// Writes to read-only or absent sources, or through texts that are
    /// more than a single token, are ignored.
    pub fn write(&mut self, value: Value, registry: &mut SourceRegistry) -> Result<()> {
        if !self.use_expr {
            self.fallback = value;
            self.evaluated = false;
            return Ok(());
        }

        let Some(path) = self.write_path() else {
            tracing::trace!("'{}' is not a plain source reference, write ignored", self.text);
            return Ok(());
        };
        let mut handle = registry.resolve(path);
        match handle.source_mut() {
            Some(source) if source.is_writable() => source
                .write(&value)
                .with_context(|| format!("Writing to {}", path)),
            _ => {
                tracing::trace!("{} is not writable, write ignored", path);
                Ok(())
            }
        }
    }

    /// Ask the bound source to report a change on the next frame
    pub fn request_refresh(&self, registry: &mut SourceRegistry) {
        if let Some(path) = self.bound_path() {
            if let Some(source) = registry.resolve(&path).source_mut() {
                source.request_changed();
            }
        }
    }

    /// Open the path picker for this expression
    pub fn request_selection(&self, registry: &mut SourceRegistry) {
        let current = find_token(&self.text)
            .map(|(_, path)| path.to_string())
            .unwrap_or_default();
        registry.request_selection(&current);
    }

    /// Replace the first token with `path` (or bind to `path` if there is no
    /// token) and switch to bound mode
    pub fn on_path_selected(&mut self, path: &str) {
        let token = format!("{{{}}}", path);
        self.text = match find_token(&self.text) {
            Some((range, _)) => {
                format!("{}{}{}", &self.text[..range.start], token, &self.text[range.end..])
            }
            None => token,
        };
        self.use_expr = true;
        self.evaluated = false;
    }

    /// Apply a pending selection from the registry, if any
    pub fn apply_selection(&mut self, registry: &mut SourceRegistry) -> bool {
        match registry.take_selection() {
            Some(path) => {
                self.on_path_selected(&path);
                true
            }
            None => false,
        }
    }

    /// Persisted form with file tokens relative to `base`
    pub fn to_state(&self, base: &Path) -> ExpressionState {
        let text = rewrite_file_tokens(&self.text, |file| {
            relative_to(&Path::new("/").join(file), base)
                .display()
                .to_string()
        });
        ExpressionState {
            text,
            use_expr: self.use_expr,
            allow_expr: self.allow_expr,
            fallback: (!self.use_expr).then(|| self.fallback.clone()),
        }
    }

    /// Restore from a persisted state saved relative to `base`
    pub fn from_state(state: ExpressionState, base: &Path) -> Self {
        let text = rewrite_file_tokens(&state.text, |file| {
            let absolute = normalize(&base.join(file));
            let absolute = absolute.display().to_string();
            absolute.trim_start_matches('/').to_string()
        });
        Self {
            text,
            fallback: state.fallback.unwrap_or(Value::Null),
            use_expr: state.use_expr && state.allow_expr,
            allow_expr: state.allow_expr,
            evaluated: false,
        }
    }
}
