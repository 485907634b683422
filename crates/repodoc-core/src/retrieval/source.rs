//! Which files of a document folder are indexed.

use std::fmt;
use std::path::Path;

use repodoc_config::RetrievalConfig;
use walkdir::WalkDir;

/// Decides which files of a document folder are eligible for indexing.
pub trait DocumentFilter: Send + Sync + fmt::Debug {
    /// Whether to descend into a directory with this name.
    fn include_dir(&self, name: &str) -> bool;

    /// Whether to index a file, given its path relative to the folder.
    fn include_file(&self, relative: &Path) -> bool;
}

/// Allow-list of extensions plus excluded directory and file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    allow_extensions: Vec<String>,
    exclude_dirs: Vec<String>,
    exclude_files: Vec<String>,
}

impl ExtensionFilter {
    pub fn new(
        allow_extensions: impl IntoIterator<Item = impl Into<String>>,
        exclude_dirs: impl IntoIterator<Item = impl Into<String>>,
        exclude_files: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            allow_extensions: allow_extensions
                .into_iter()
                .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            exclude_dirs: exclude_dirs.into_iter().map(Into::into).collect(),
            exclude_files: exclude_files.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(
            config.allow_extensions.iter().cloned(),
            config.exclude_dirs.iter().cloned(),
            config.exclude_files.iter().cloned(),
        )
    }
}

impl DocumentFilter for ExtensionFilter {
    fn include_dir(&self, name: &str) -> bool {
        !self.exclude_dirs.iter().any(|d| d == name)
    }

    fn include_file(&self, relative: &Path) -> bool {
        let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if self.exclude_files.iter().any(|f| f == name) {
            return false;
        }
        relative
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.allow_extensions.contains(&e))
    }
}

/// One eligible file and its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Path relative to the folder, `/`-separated.
    pub path: String,
    pub text: String,
}

/// Read every eligible file under `folder`, in path order.
///
/// Symlinks are not followed. Unreadable files are skipped.
pub fn collect_documents(
    folder: &Path,
    filter: &dyn DocumentFilter,
) -> std::io::Result<Vec<SourceDocument>> {
    let mut documents = Vec::new();
    let walker = WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || filter.include_dir(&e.file_name().to_string_lossy())
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(folder) else {
            continue;
        };
        if !filter.include_file(relative) {
            continue;
        }
        let bytes = match std::fs::read(entry.path()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "skipping unreadable file");
                continue;
            }
        };
        documents.push(SourceDocument {
            path: relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            text: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(documents)
}
