//! Temporary repository snapshots.

use std::path::{Path, PathBuf};

use repodoc_core::Snapshot;
use tempfile::TempDir;

/// A throwaway directory tree, deleted on drop.
///
/// # Example
///
/// ```ignore
/// let repo = TestSnapshot::new()
///     .file("README.md", "# Demo")
///     .file("src/lib.rs", "pub fn demo() {}");
/// let snapshot = repo.snapshot();
/// ```
pub struct TestSnapshot {
    dir: TempDir,
}

impl TestSnapshot {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    /// Write `content` at `relative`, creating parent directories.
    pub fn file(self, relative: &str, content: &str) -> Self {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, content).expect("write fixture file");
        self
    }

    pub fn dir(self, relative: &str) -> Self {
        std::fs::create_dir_all(self.dir.path().join(relative)).expect("create dir");
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.dir.path(), Some("test-rev".to_string())).expect("open snapshot")
    }
}

impl Default for TestSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
