//! Overlapping window chunker over normalized pages.
//!
//! Each page's text is split into windows of `window_units` words that
//! overlap by `overlap_units` words. Windows are sliced from the original
//! text at word boundaries, so line breaks inside a window survive and the
//! split is always UTF-8 safe.
//!
//! Chunk indices restart at 0 on every page, which keeps a chunk's
//! [`ChunkKey`] stable as long as that page's text is unchanged, even when
//! other pages of the same document change.
//!
//! # Example
//!
//! ```rust
//! use groundwork_core::chunk::{split_windows, ChunkParams};
//!
//! let params = ChunkParams { window_units: 4, overlap_units: 1 };
//! let windows = split_windows("a b c d e f g", &params);
//! assert_eq!(windows, vec!["a b c d", "d e f g"]);
//! ```

use sha2::{Digest, Sha256};

use crate::chunk_key::ChunkKey;
use crate::models::{ChunkDraft, Document, NormalizedPage};

/// Window geometry, in whitespace-delimited units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub window_units: usize,
    pub overlap_units: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            window_units: 500,
            overlap_units: 60,
        }
    }
}

impl ChunkParams {
    fn stride(&self) -> usize {
        self.window_units
            .saturating_sub(self.overlap_units)
            .max(1)
    }
}

/// Split every page of `document` into chunk drafts, in page order.
///
/// Pages with no words produce no chunks.
pub fn chunk_pages(
    document: &Document,
    pages: &[NormalizedPage],
    params: &ChunkParams,
) -> Vec<ChunkDraft> {
    let mut drafts = Vec::new();
    for page in pages {
        for (index, window) in split_windows(&page.text, params).into_iter().enumerate() {
            let key = ChunkKey::new(
                &document.document_id,
                &document.revision_id,
                page.page_number,
                page.method,
                index as u32,
            );
            drafts.push(ChunkDraft {
                key,
                hash: hash_text(window),
                text: window.to_string(),
                confidence: page.confidence,
            });
        }
    }
    drafts
}

/// Split `text` into overlapping word windows.
///
/// The final window always ends at the last word; no window is emitted
/// that is entirely contained in the previous one.
pub fn split_windows<'a>(text: &'a str, params: &ChunkParams) -> Vec<&'a str> {
    let spans = word_spans(text);
    if spans.is_empty() || params.window_units == 0 {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + params.window_units).min(spans.len());
        windows.push(&text[spans[start].0..spans[end - 1].1]);
        if end == spans.len() {
            break;
        }
        start += params.stride();
    }
    windows
}

/// SHA-256 of a chunk's text, hex encoded.
pub fn hash_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Byte spans `(start, end)` of whitespace-delimited words.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        match (ch.is_whitespace(), current) {
            (true, Some(s)) => {
                spans.push((s, i));
                current = None;
            }
            (false, None) => current = Some(i),
            _ => {}
        }
    }
    if let Some(s) = current {
        spans.push((s, text.len()));
    }
    spans
}
