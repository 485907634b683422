//! Read-only filesystem tools: `list_files`, `read_file`, `search_code`.
//!
//! These are synchronous; the registry runs them on the blocking pool.

use std::path::Path;

use walkdir::{DirEntry, WalkDir};

use super::{Snapshot, ToolError, ToolLimits};

/// Longest snippet returned per search hit, in characters.
const SNIPPET_CHARS: usize = 200;

/// Files larger than this are not searched.
const MAX_SEARCH_FILE_BYTES: u64 = 2 * 1024 * 1024;

/// One `search_code` hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Path relative to the snapshot root.
    pub file: String,
    /// 1-based line number.
    pub line: usize,
    pub snippet: String,
}

fn is_excluded(entry: &DirEntry, limits: &ToolLimits) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && limits
            .exclude_dirs
            .iter()
            .any(|d| entry.file_name().to_string_lossy() == d.as_str())
}

/// Regular files under `dir`, sorted by path, skipping excluded directories
/// and symlinks.
fn walk_files<'a>(dir: &Path, limits: &'a ToolLimits) -> impl Iterator<Item = DirEntry> + 'a {
    WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| !is_excluded(e, limits))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
}

/// List files under `path`, relative to the snapshot root.
pub fn list_files(
    snapshot: &Snapshot,
    limits: &ToolLimits,
    path: &str,
) -> Result<Vec<String>, ToolError> {
    let dir = snapshot.resolve(path)?;
    if dir.is_file() {
        return Ok(vec![snapshot.relative(&dir)]);
    }
    Ok(walk_files(&dir, limits)
        .map(|e| snapshot.relative(e.path()))
        .collect())
}

/// Read a file as text, truncating at `limits.max_read_bytes`.
pub fn read_file(snapshot: &Snapshot, limits: &ToolLimits, path: &str) -> Result<String, ToolError> {
    let file = snapshot.resolve(path)?;
    if file.is_dir() {
        return Err(ToolError::InvalidArguments {
            tool: "read_file".to_string(),
            message: format!("{path} is a directory, use list_files"),
        });
    }
    let bytes = std::fs::read(&file).map_err(|e| ToolError::Io(e.to_string()))?;
    if bytes.len() > limits.max_read_bytes {
        let mut cut = limits.max_read_bytes;
        // Back off to a char boundary so the prefix is not mangled.
        while cut > 0 && (bytes[cut] & 0b1100_0000) == 0b1000_0000 {
            cut -= 1;
        }
        let partial = format!(
            "{}\n[... truncated: {} bytes total, showing first {} ...]",
            String::from_utf8_lossy(&bytes[..cut]),
            bytes.len(),
            cut
        );
        return Err(ToolError::TooLarge {
            path: snapshot.relative(&file),
            size: bytes.len(),
            max: limits.max_read_bytes,
            partial,
        });
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Literal substring search.
///
/// Files with more hits rank first, ties broken by path; hits within a file
/// are in line order. The result is capped at `limits.max_search_results`.
pub fn search_code(
    snapshot: &Snapshot,
    limits: &ToolLimits,
    query: &str,
    scope: Option<&str>,
) -> Result<Vec<SearchHit>, ToolError> {
    if query.is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: "search_code".to_string(),
            message: "query must not be empty".to_string(),
        });
    }
    let dir = snapshot.resolve(scope.unwrap_or("."))?;

    let mut per_file: Vec<(String, Vec<SearchHit>)> = Vec::new();
    for entry in walk_files(&dir, limits) {
        if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_SEARCH_FILE_BYTES {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.iter().take(8000).any(|b| *b == 0) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let file = snapshot.relative(entry.path());
        let hits: Vec<SearchHit> = text
            .lines()
            .enumerate()
            .filter(|(_, line)| line.contains(query))
            .map(|(i, line)| SearchHit {
                file: file.clone(),
                line: i + 1,
                snippet: line.trim().chars().take(SNIPPET_CHARS).collect(),
            })
            .collect();
        if !hits.is_empty() {
            per_file.push((file, hits));
        }
    }

    per_file.sort_by(|(a_path, a), (b_path, b)| b.len().cmp(&a.len()).then_with(|| a_path.cmp(b_path)));
    Ok(per_file
        .into_iter()
        .flat_map(|(_, hits)| hits)
        .take(limits.max_search_results)
        .collect())
}
