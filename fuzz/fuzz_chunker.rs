//! Fuzz target for document chunking.
//!
//! Run with: cargo +nightly fuzz run fuzz_chunker
//!
//! The first two bytes pick the chunk size and overlap; the rest is the text.
//! Every character must be covered and every chunk must match its offsets.

#![no_main]

use libfuzzer_sys::fuzz_target;
use repodoc_core::retrieval::chunk_text;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let size = usize::from(data[0]) + 1;
    let overlap = usize::from(data[1]) % size;
    let Ok(text) = std::str::from_utf8(&data[2..]) else {
        return;
    };

    let chunks = chunk_text("fuzz.txt", text, size, overlap);
    let chars: Vec<char> = text.chars().collect();
    let mut covered = 0;
    for chunk in &chunks {
        assert!(chunk.start <= covered, "gap before {}", chunk.start);
        assert!(chunk.end - chunk.start <= size);
        let expected: String = chars[chunk.start..chunk.end].iter().collect();
        assert_eq!(chunk.text, expected);
        covered = covered.max(chunk.end);
    }
    assert_eq!(covered, chars.len());
});
