//! On-disk persistence of vector indexes.
//!
//! ```text
//! <store_dir>/
//!   <folder-name>-<sha256(folder)[..16]>/
//!     <model>/index.json      meta + chunk records
//!     <model>/vectors.bin     little-endian f32, entry after entry
//!     <model>.building        present while a build holds the key
//! ```
//!
//! An index directory is written under a temporary name and renamed into
//! place, so readers see either a complete index or none.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::chunk::Chunk;
use super::index::{IndexEntry, IndexMeta, SCHEMA_VERSION, VectorIndex};
use super::lock::{BuildMarker, KeyLocks};

pub const INDEX_FILE: &str = "index.json";
pub const VECTORS_FILE: &str = "vectors.bin";

/// Errors from reading or writing the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the index of one (folder, model) pair lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub folder: PathBuf,
    pub model: String,
    pub dir: PathBuf,
}

#[derive(Serialize)]
struct StoredIndexRef<'a> {
    meta: &'a IndexMeta,
    entries: Vec<StoredEntryRef<'a>>,
}

#[derive(Serialize)]
struct StoredEntryRef<'a> {
    #[serde(flatten)]
    chunk: &'a Chunk,
    file_order: usize,
}

#[derive(Deserialize)]
struct StoredIndex {
    meta: IndexMeta,
    entries: Vec<StoredEntry>,
}

#[derive(Deserialize)]
struct StoredEntry {
    #[serde(flatten)]
    chunk: Chunk,
    file_order: usize,
}

/// Root of all persisted indexes. Share one instance (behind an `Arc`)
/// between sessions so their builds are serialized per key.
#[derive(Debug)]
pub struct IndexStore {
    root: PathBuf,
    locks: KeyLocks,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyLocks::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key of `folder` (expected canonical) indexed with `model`.
    pub fn key(&self, folder: &Path, model: &str) -> IndexKey {
        let mut hasher = Sha256::new();
        hasher.update(folder.to_string_lossy().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let name = folder
            .file_name()
            .map(|n| sanitize(&n.to_string_lossy()))
            .unwrap_or_else(|| "root".to_string());
        IndexKey {
            folder: folder.to_path_buf(),
            model: model.to_string(),
            dir: self
                .root
                .join(format!("{name}-{}", &digest[..16]))
                .join(sanitize(model)),
        }
    }

    /// In-process build lock of `key`.
    pub(crate) fn lock(&self, key: &IndexKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.get(&key.dir)
    }

    pub fn marker_path(&self, key: &IndexKey) -> PathBuf {
        BuildMarker::path_for(&key.dir)
    }

    /// Whether a complete index directory exists for `key`.
    pub fn exists(&self, key: &IndexKey) -> bool {
        key.dir.join(INDEX_FILE).is_file() && key.dir.join(VECTORS_FILE).is_file()
    }

    /// Load the index of `key`.
    ///
    /// Returns `Ok(None)` when there is none, or when the persisted one is
    /// unreadable or inconsistent (logged as a warning).
    pub async fn load(&self, key: &IndexKey) -> Result<Option<VectorIndex>, StoreError> {
        let json = match tokio::fs::read(key.dir.join(INDEX_FILE)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let blob = match tokio::fs::read(key.dir.join(VECTORS_FILE)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(index = %key.dir.display(), "index has no vectors file, ignoring it");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match decode(key, &json, &blob) {
            Ok(index) => {
                debug!(index = %key.dir.display(), entries = index.len(), "index loaded");
                Ok(Some(index))
            }
            Err(reason) => {
                warn!(index = %key.dir.display(), reason, "persisted index is corrupt, ignoring it");
                Ok(None)
            }
        }
    }

    /// Persist `index` under `key`, replacing any previous one.
    pub async fn save(&self, key: &IndexKey, index: &VectorIndex) -> Result<(), StoreError> {
        let parent = key.dir.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let name = key
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{name}.tmp-{}-{nanos}", std::process::id()));

        let written = write_index_dir(&tmp, index).await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_dir_all(&tmp).await;
            return Err(err);
        }

        if tokio::fs::try_exists(&key.dir).await? {
            tokio::fs::remove_dir_all(&key.dir).await?;
        }
        if let Err(err) = tokio::fs::rename(&tmp, &key.dir).await {
            let _ = tokio::fs::remove_dir_all(&tmp).await;
            return Err(err.into());
        }
        info!(index = %key.dir.display(), entries = index.len(), "index saved");
        Ok(())
    }

    /// Delete the index of `key`. Returns whether one existed.
    pub async fn remove(&self, key: &IndexKey) -> Result<bool, StoreError> {
        match tokio::fs::remove_dir_all(&key.dir).await {
            Ok(()) => {
                info!(index = %key.dir.display(), "index removed");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

async fn write_index_dir(dir: &Path, index: &VectorIndex) -> Result<(), StoreError> {
    tokio::fs::create_dir(dir).await?;

    let stored = StoredIndexRef {
        meta: &index.meta,
        entries: index
            .entries
            .iter()
            .map(|e| StoredEntryRef {
                chunk: &e.chunk,
                file_order: e.file_order,
            })
            .collect(),
    };
    write_synced(&dir.join(INDEX_FILE), &serde_json::to_vec(&stored)?).await?;

    let mut blob = Vec::with_capacity(index.len() * index.meta.dims * 4);
    for entry in &index.entries {
        blob.extend_from_slice(&vec_to_blob(&entry.vector));
    }
    write_synced(&dir.join(VECTORS_FILE), &blob).await?;
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

fn decode(key: &IndexKey, json: &[u8], blob: &[u8]) -> Result<VectorIndex, String> {
    let stored: StoredIndex =
        serde_json::from_slice(json).map_err(|e| format!("invalid metadata: {e}"))?;
    let meta = stored.meta;
    if meta.schema_version != SCHEMA_VERSION {
        return Err(format!(
            "schema version {} (expected {SCHEMA_VERSION})",
            meta.schema_version
        ));
    }
    if meta.model != key.model || meta.folder != key.folder {
        return Err("built for a different folder or model".to_string());
    }
    if meta.dims == 0 || stored.entries.is_empty() {
        return Err("index is empty".to_string());
    }
    let expected = stored.entries.len() * meta.dims * 4;
    if blob.len() != expected {
        return Err(format!(
            "vectors file is {} bytes, expected {expected}",
            blob.len()
        ));
    }

    let entries = stored
        .entries
        .into_iter()
        .zip(blob.chunks_exact(meta.dims * 4))
        .map(|(e, bytes)| IndexEntry {
            chunk: e.chunk,
            file_order: e.file_order,
            vector: blob_to_vec(bytes),
        })
        .collect();
    Ok(VectorIndex { meta, entries })
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes; a trailing partial value is ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
