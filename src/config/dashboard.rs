//! Dashboard files
//!
//! A dashboard file is a JSON document holding named expressions. File
//! paths inside expressions are stored relative to the dashboard file's
//! directory, so a dashboard can be moved together with its data.
//!
//! ```json
//! {
//!   "version": 1,
//!   "name": "robot",
//!   "expressions": [
//!     { "name": "speed", "text": "{/topics/odom.twist.twist.linear.x}", "use_expr": true, "allow_expr": true },
//!     { "name": "gain", "text": "", "use_expr": false, "allow_expr": true, "fallback": 1.5 }
//!   ]
//! }
//! ```

use crate::error::{DashError, Result};
use crate::scripting::{Expression, ExpressionState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Dashboard file extension
pub const DASHBOARD_FILE_EXTENSION: &str = "json";

/// One named expression in a dashboard file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExpression {
    pub name: String,
    #[serde(flatten)]
    pub state: ExpressionState,
}

/// Dashboard file format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardFile {
    /// Format version for future compatibility
    #[serde(default = "default_dashboard_version")]
    pub version: u32,

    /// Dashboard name
    #[serde(default)]
    pub name: String,

    /// Frame rate the headless runner should use, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_hz: Option<f64>,

    #[serde(default)]
    pub expressions: Vec<NamedExpression>,
}

fn default_dashboard_version() -> u32 {
    1
}

impl Default for DashboardFile {
    fn default() -> Self {
        Self {
            version: 1,
            name: "Untitled Dashboard".to_string(),
            rate_hz: None,
            expressions: Vec::new(),
        }
    }
}

/// Directory relative file paths in a dashboard at `path` are resolved against
pub fn base_dir(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or(Path::new("/"));
    if dir.is_absolute() {
        return dir.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}

impl DashboardFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a dashboard file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DashError::Config(format!("Failed to read dashboard file {:?}: {}", path, e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            DashError::Config(format!("Failed to parse dashboard file {:?}: {}", path, e))
        })
    }

    /// Save the dashboard to disk as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DashError::Config(format!("Failed to create dashboard directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DashError::Config(format!("Failed to serialize dashboard: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            DashError::Config(format!("Failed to write dashboard file {:?}: {}", path, e))
        })
    }

    /// Add an expression, storing file paths relative to `base`
    pub fn push(&mut self, name: impl Into<String>, expression: &Expression, base: &Path) {
        self.expressions.push(NamedExpression {
            name: name.into(),
            state: expression.to_state(base),
        });
    }

    /// Restore all expressions, resolving file paths against `base`
    pub fn expressions(&self, base: &Path) -> Vec<(String, Expression)> {
        self.expressions
            .iter()
            .map(|e| (e.name.clone(), Expression::from_state(e.state.clone(), base)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_dashboard_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dash").join("robot.json");
        let base = base_dir(&path);
        let data = dir.path().join("data").join("run.csv");

        let mut dash = DashboardFile::new("robot");
        dash.push(
            "points",
            &Expression::bound(format!("2 * {{/files{}}}", data.display())),
            &base,
        );
        dash.push("gain", &Expression::literal(1.5), &base);
        dash.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("{/files/../data/run.csv}"));

        let loaded = DashboardFile::load(&path).unwrap();
        assert_eq!(loaded, dash);
        let exprs = loaded.expressions(&base);
        assert_eq!(exprs[0].0, "points");
        assert_eq!(exprs[0].1.text(), format!("2 * {{/files{}}}", data.display()));
        assert_eq!(exprs[1].1.fallback(), &json!(1.5));
        assert!(!exprs[1].1.use_expr());
    }

    #[test]
    fn test_minimal_dashboard_uses_defaults() {
        let dash: DashboardFile =
            serde_json::from_str(r#"{"expressions": [{"name": "a", "text": "{/topics/a}", "use_expr": true}]}"#)
                .unwrap();
        assert_eq!(dash.version, 1);
        assert!(dash.expressions[0].state.allow_expr);
        assert!(dash.expressions[0].state.fallback.is_none());
    }

    #[test]
    fn test_missing_dashboard_is_config_error() {
        let err = DashboardFile::load("/nonexistent/dash.json").unwrap_err();
        assert!(matches!(err, DashError::Config(_)));
    }
}
