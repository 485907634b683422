//! In-memory vector index and nearest-neighbour search.

use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chunk::Chunk;

/// Bumped whenever the persisted layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// What an index was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub folder: PathBuf,
    pub model: String,
    pub built_at: DateTime<Utc>,
    pub dims: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub schema_version: u32,
}

/// A chunk, the position of its file in the folder, and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    /// Rank of the source file in path order.
    pub file_order: usize,
    pub vector: Vec<f32>,
}

/// A retrieved entry with its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredChunk<'a> {
    pub entry: &'a IndexEntry,
    pub score: f32,
}

/// Chunks of one document folder with their embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    pub meta: IndexMeta,
    pub entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `k` entries most similar to `query`.
    ///
    /// Ordered by cosine similarity, highest first; equal scores are ordered
    /// by file order, then by start offset.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<ScoredChunk<'_>> {
        let mut scored: Vec<ScoredChunk<'_>> = self
            .entries
            .iter()
            .map(|entry| ScoredChunk {
                entry,
                score: cosine_similarity(query, &entry.vector),
            })
            .collect();
        scored.sort_by(rank_order);
        scored.truncate(k);
        scored
    }
}

fn rank_order(a: &ScoredChunk<'_>, b: &ScoredChunk<'_>) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.entry.file_order.cmp(&b.entry.file_order))
        .then(a.entry.chunk.start.cmp(&b.entry.chunk.start))
}

/// Cosine similarity of two vectors; `0.0` for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
