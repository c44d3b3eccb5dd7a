//! Deterministic chunk identity.
//!
//! Every indexed window of text is named by the tuple
//! `(document_id, revision_id, page_number, extraction_method, chunk_index)`
//! rendered as:
//!
//! ```text
//! {document_id}#rev:{revision_id}#p:{page_number}#m:{method}#c:{chunk_index}
//! ```
//!
//! The rendering is a pure function, so re-indexing the same revision always
//! yields byte-identical keys and writes become upserts. A `#` or `%` inside
//! the free-form components is percent-escaped, which keeps the mapping
//! injective and lets [`ChunkKey::from_str`] invert it exactly.
//!
//! ```rust
//! use groundwork_core::chunk_key::ChunkKey;
//! use groundwork_core::models::ExtractionMethod;
//!
//! let key = ChunkKey::new("doc1", "r1", 1, ExtractionMethod::DigitalText, 0);
//! assert_eq!(key.to_string(), "doc1#rev:r1#p:1#m:digital_text#c:0");
//! assert_eq!(key.to_string().parse::<ChunkKey>().unwrap(), key);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::models::ExtractionMethod;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub document_id: String,
    pub revision_id: String,
    pub page_number: u32,
    pub method: ExtractionMethod,
    pub chunk_index: u32,
}

impl ChunkKey {
    pub fn new(
        document_id: &str,
        revision_id: &str,
        page_number: u32,
        method: ExtractionMethod,
        chunk_index: u32,
    ) -> Self {
        Self {
            document_id: document_id.to_string(),
            revision_id: revision_id.to_string(),
            page_number,
            method,
            chunk_index,
        }
    }

    /// True when both keys name the same page of the same document,
    /// regardless of revision, method, or window.
    pub fn same_page(&self, other: &ChunkKey) -> bool {
        self.document_id == other.document_id && self.page_number == other.page_number
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#rev:{}#p:{}#m:{}#c:{}",
            escape(&self.document_id),
            escape(&self.revision_id),
            self.page_number,
            self.method,
            self.chunk_index
        )
    }
}

/// Error returned when a string is not a well-formed chunk key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed chunk key '{key}': {reason}")]
pub struct ParseChunkKeyError {
    pub key: String,
    pub reason: String,
}

impl FromStr for ChunkKey {
    type Err = ParseChunkKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| ParseChunkKeyError {
            key: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split('#').collect();
        if parts.len() != 5 {
            return Err(fail("expected 5 '#'-separated components"));
        }

        let field = |part: &str, prefix: &str| -> Result<String, ParseChunkKeyError> {
            part.strip_prefix(prefix)
                .map(str::to_string)
                .ok_or_else(|| fail(&format!("missing '{}' component", prefix)))
        };

        let document_id = unescape(parts[0]).ok_or_else(|| fail("bad escape in document id"))?;
        let revision_id = unescape(&field(parts[1], "rev:")?)
            .ok_or_else(|| fail("bad escape in revision id"))?;
        let page_number = field(parts[2], "p:")?
            .parse::<u32>()
            .map_err(|_| fail("page number is not an integer"))?;
        let method = field(parts[3], "m:")?
            .parse::<ExtractionMethod>()
            .map_err(|e| fail(&e))?;
        let chunk_index = field(parts[4], "c:")?
            .parse::<u32>()
            .map_err(|_| fail("chunk index is not an integer"))?;

        Ok(ChunkKey {
            document_id,
            revision_id,
            page_number,
            method,
            chunk_index,
        })
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '#' => out.push_str("%23"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "23" => out.push('#'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_canonical_form() {
        let key = ChunkKey::new("doc1", "r1", 1, ExtractionMethod::DigitalText, 0);
        assert_eq!(key.to_string(), "doc1#rev:r1#p:1#m:digital_text#c:0");
    }

    #[test]
    fn stable_across_calls() {
        let a = ChunkKey::new("1AbC", "2024-01-01T00:00:00Z", 3, ExtractionMethod::Ocr, 7);
        let b = ChunkKey::new("1AbC", "2024-01-01T00:00:00Z", 3, ExtractionMethod::Ocr, 7);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn method_change_yields_distinct_key() {
        let text = ChunkKey::new("d", "r", 2, ExtractionMethod::DigitalText, 0);
        let ocr = ChunkKey::new("d", "r", 2, ExtractionMethod::Ocr, 0);
        assert_ne!(text.to_string(), ocr.to_string());
        assert!(text.same_page(&ocr));
    }

    #[test]
    fn hash_in_document_id_does_not_collide() {
        // Without escaping, these two would render identically.
        let tricky = ChunkKey::new("a#rev:b", "c", 1, ExtractionMethod::DigitalText, 0);
        let plain = ChunkKey::new("a", "b#rev:c", 1, ExtractionMethod::DigitalText, 0);
        assert_ne!(tricky.to_string(), plain.to_string());
        assert_eq!(tricky.to_string().parse::<ChunkKey>().unwrap(), tricky);
        assert_eq!(plain.to_string().parse::<ChunkKey>().unwrap(), plain);
    }

    #[test]
    fn percent_is_escaped() {
        let key = ChunkKey::new("100%", "r%23", 1, ExtractionMethod::Ocr, 4);
        assert_eq!(key.to_string(), "100%25#rev:r%2523#p:1#m:ocr#c:4");
        assert_eq!(key.to_string().parse::<ChunkKey>().unwrap(), key);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("doc1#rev:r1#p:x#m:ocr#c:0".parse::<ChunkKey>().is_err());
        assert!("doc1#rev:r1#p:1#m:scan#c:0".parse::<ChunkKey>().is_err());
        assert!("doc1#r1#p:1#m:ocr#c:0".parse::<ChunkKey>().is_err());
        assert!("doc1".parse::<ChunkKey>().is_err());
        assert!("bad%zz#rev:r#p:1#m:ocr#c:0".parse::<ChunkKey>().is_err());
    }
}
