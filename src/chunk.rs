//! Fixed-size overlapping text splitter.
//!
//! Splits document text into chunks of at most `max_chars` characters with
//! `overlap` characters carried over between consecutive chunks. Breaks
//! prefer the last whitespace inside the window so words survive intact
//! where possible. Operates on characters, never raw bytes, so multi-byte
//! text is split safely.

use sha2::{Digest, Sha256};

/// Split `text` into overlapping chunks. Empty or whitespace-only input
/// yields no chunks. `overlap` is clamped below `max_chars` so the walk
/// always advances.
pub fn split_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }

    let overlap = overlap.min(max_chars.saturating_sub(1));
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < n {
        let hard_end = (start + max_chars).min(n);
        let end = if hard_end < n {
            match chars[start..hard_end].iter().rposition(|c| c.is_whitespace()) {
                Some(pos) if pos > 0 => start + pos + 1,
                _ => hard_end,
            }
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= n {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// SHA-256 hash of a chunk's text, for staleness detection.
pub fn chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_single_chunk() {
        let chunks = split_text("Hello, world!", 2000, 200);
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(split_text("", 2000, 200).is_empty());
        assert!(split_text("   \n  ", 2000, 200).is_empty());
    }

    #[test]
    fn chunks_respect_max_chars() {
        let text = "word ".repeat(500);
        let chunks = split_text(&text, 100, 20);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100, "oversized chunk: {}", chunk);
            assert!(!chunk.is_empty());
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        // No whitespace, so breaks land on hard boundaries and the overlap
        // region is exact.
        let text = "0123456789".repeat(10);
        let chunks = split_text(&text, 30, 5);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect();
            assert!(pair[1].starts_with(&tail));
        }
    }

    #[test]
    fn terminates_when_overlap_not_smaller_than_chunk() {
        let text = "x".repeat(50);
        let chunks = split_text(&text, 10, 10);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 10);
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "păsări și copaci ".repeat(50);
        let chunks = split_text(&text, 40, 8);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 40);
        }
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(chunk_hash("alpha"), chunk_hash("alpha"));
        assert_ne!(chunk_hash("alpha"), chunk_hash("beta"));
    }
}
