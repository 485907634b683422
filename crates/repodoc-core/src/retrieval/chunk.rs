//! Fixed-stride text chunker.
//!
//! Text is cut into windows of `size` characters starting every
//! `size - overlap` characters, so consecutive chunks share `overlap`
//! characters of boundary context. Offsets count characters, not bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A slice of one source document.
///
/// Identity is `(source, start, end)`; `hash` changes only when the text does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Path relative to the document folder, `/`-separated.
    pub source: String,
    /// First character, inclusive.
    pub start: usize,
    /// Last character, exclusive.
    pub end: usize,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into overlapping chunks. Empty text yields no chunks.
pub fn chunk_text(source: &str, text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    let size = size.max(1);
    let stride = size.saturating_sub(overlap).max(1);

    // Byte offset of every char boundary, plus the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = bounds.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + size).min(total);
        chunks.push(make_chunk(source, start, end, &text[bounds[start]..bounds[end]]));
        if end == total {
            break;
        }
        start += stride;
    }
    chunks
}

fn make_chunk(source: &str, start: usize, end: usize, text: &str) -> Chunk {
    Chunk {
        source: source.to_string(),
        start,
        end,
        text: text.to_string(),
        hash: content_hash(text),
    }
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
