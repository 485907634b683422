//! Snapshot root and path confinement.
//!
//! Every tool resolves paths through [`Snapshot::resolve`]. A path is
//! normalized lexically first (so `a/../../b` is rejected before touching the
//! filesystem) and then canonicalized, which catches symlinks pointing out of
//! the root.

use std::path::{Component, Path, PathBuf};

use super::ToolError;

/// A repository snapshot: a filesystem root plus an optional fixed revision.
///
/// Acquiring the tree (clone, checkout) happens elsewhere; the snapshot only
/// confines access to what is already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: PathBuf,
    revision: Option<String>,
}

impl Snapshot {
    /// Open a snapshot rooted at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, revision: Option<String>) -> std::io::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("snapshot root {} is not a directory", root.display()),
            ));
        }
        Ok(Self { root, revision })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Resolve a path given by the model to an existing path inside the root.
    ///
    /// Relative paths are taken from the root. Absolute paths are accepted
    /// only if they already lie inside it.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, ToolError> {
        let requested = requested.trim();
        let candidate = Path::new(if requested.is_empty() { "." } else { requested });

        let normalized = if candidate.is_absolute() {
            let absolute = normalize(candidate, PathBuf::new())
                .ok_or_else(|| ToolError::PathEscape(requested.to_string()))?;
            if !absolute.starts_with(&self.root) {
                return Err(ToolError::PathEscape(requested.to_string()));
            }
            absolute
        } else {
            normalize(candidate, self.root.clone())
                .filter(|p| p.starts_with(&self.root))
                .ok_or_else(|| ToolError::PathEscape(requested.to_string()))?
        };

        if std::fs::symlink_metadata(&normalized).is_err() {
            return Err(ToolError::NotFound(requested.to_string()));
        }
        let canonical = normalized
            .canonicalize()
            .map_err(|_| ToolError::NotFound(requested.to_string()))?;
        if !canonical.starts_with(&self.root) {
            return Err(ToolError::PathEscape(requested.to_string()));
        }
        Ok(canonical)
    }

    /// Path relative to the root, with `/` separators, for display to the model.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            ".".to_string()
        } else {
            parts.join("/")
        }
    }
}

/// Apply `path`'s components to `base` without touching the filesystem.
///
/// Returns `None` when `..` would climb above `base`'s first component.
fn normalize(path: &Path, base: PathBuf) -> Option<PathBuf> {
    let floor = base.components().count();
    let mut out = base;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.components().count() <= floor.max(1) || !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
