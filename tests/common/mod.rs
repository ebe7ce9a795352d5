//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use imdash_core::{AppConfig, LoopbackBus, SourceRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How long to wait for background feed workers
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// A registry over a temporary browse root and shared-memory directory
pub struct TestEnv {
    pub registry: SourceRegistry,
    pub bus: LoopbackBus,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let bus = LoopbackBus::new();
        let mut config = AppConfig::default();
        config.filesystem.browse_root = dir.path().to_path_buf();
        config.stores.shm_dir = dir.path().join("shm");
        std::fs::create_dir_all(&config.stores.shm_dir).expect("shm dir");
        let registry =
            SourceRegistry::new(&config, Arc::new(bus.clone())).expect("registry");
        Self { registry, bus, dir }
    }

    pub fn shm_dir(&self) -> PathBuf {
        self.dir.path().join("shm")
    }

    /// Write a file under the temp dir and return its source path
    pub fn write_file(&self, name: &str, content: &str) -> String {
        let file = self.dir.path().join(name);
        std::fs::write(&file, content).expect("write file");
        file_source_path(&file)
    }

    /// Run one frame, resolving `paths` so they stay alive
    pub fn frame(&mut self, paths: &[&str]) -> usize {
        self.registry.begin_frame();
        for p in paths {
            self.registry.resolve(p);
        }
        self.registry.end_frame()
    }

    /// Run frames until `path` reports a change, or the timeout expires
    pub fn wait_for_change(&mut self, path: &str) -> bool {
        let deadline = Instant::now() + test_timeout();
        while Instant::now() < deadline {
            self.registry.begin_frame();
            let changed = self.registry.resolve(path).changed();
            self.registry.end_frame();
            if changed {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

pub fn file_source_path(file: &Path) -> String {
    format!("/files{}", file.display())
}

/// Push a file's modification time forward so the next poll reloads it
pub fn bump_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open file");
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(secs))
        .expect("set mtime");
}
