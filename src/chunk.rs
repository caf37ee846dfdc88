//! Overlapping, separator-aware text chunker.
//!
//! Splits document text into windows of at most `chunk_size` characters
//! (Unicode scalar values, not bytes). Each window ends at the best break
//! point available, trying separator tiers in order: paragraph, sentence or
//! line, whitespace, and finally any character. The next window starts
//! exactly `chunk_overlap` characters before the previous one ended, so
//! adjacent chunks always share that many characters of context.

use crate::models::{Chunk, SourceDocument};

/// Separator tiers, most preferred first. A break is placed right after the
/// separator so it stays with the preceding chunk.
const SEPARATOR_TIERS: &[&[&str]] = &[
    &["\n\n"],
    &["\n", ". ", "! ", "? ", "; ", "。", "！", "？", "；"],
    &[" ", "\t"],
];

/// Split `text` into overlapping windows.
///
/// Whitespace-only input yields no chunks. Callers must ensure
/// `chunk_overlap < chunk_size`; config validation enforces it.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if text.trim().is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let overlap = chunk_overlap.min(chunk_size - 1);

    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    loop {
        if chars.len() - start <= chunk_size {
            pieces.push(chars[start..].iter().collect());
            break;
        }

        let hard_end = start + chunk_size;
        // Ending at or before this point would not advance the window.
        let min_end = start + overlap + 1;
        let end = find_break(&chars, min_end, hard_end);

        pieces.push(chars[start..end].iter().collect());
        start = end - overlap;
    }

    pieces
}

/// Find the latest break point in `[min_end, hard_end]`, preferring
/// higher separator tiers over later positions.
fn find_break(chars: &[char], min_end: usize, hard_end: usize) -> usize {
    for tier in SEPARATOR_TIERS {
        for end in (min_end..=hard_end).rev() {
            if tier.iter().any(|sep| ends_with_at(chars, end, sep)) {
                return end;
            }
        }
    }
    hard_end
}

fn ends_with_at(chars: &[char], end: usize, sep: &str) -> bool {
    let sep_len = sep.chars().count();
    if end < sep_len {
        return false;
    }
    chars[end - sep_len..end].iter().copied().eq(sep.chars())
}

/// Chunk one document, tagging every piece with its provenance.
pub fn chunk_document(doc: &SourceDocument, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    split_text(&doc.content, chunk_size, chunk_overlap)
        .into_iter()
        .map(|content| Chunk {
            content,
            source_file: doc.source_file.clone(),
            markdown_file: doc.markdown_file.clone(),
        })
        .collect()
}
