//! Enumeration cues and the document catalog fallback.
//!
//! List-style questions ("list all documents", "show me the top 5 files")
//! are served from catalog metadata when synthesis comes back degenerate,
//! since the catalog is ground truth and retrieval recall is not.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::answer::{AnswerStyle, Citation, RefusalReason, StructuredAnswer};
use crate::models::Document;

/// Answer text when the tenant has no documents to list.
pub const EMPTY_CATALOG_TEXT: &str = "Insufficient information";

static ENUMERATION_CUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(list|all|show|enumerate|provide|give me|top)\b")
        .expect("enumeration pattern compiles")
});

static CATALOG_CUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(documents?|docs?|files?|knowledge base|drive|folders?|pdfs?|sources?|uploads?)\b",
    )
    .expect("catalog pattern compiles")
});

static LIST_LIMITS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)\b(?:top|list|show|give me|provide)\s+(\d+)\b")
            .expect("limit pattern compiles"),
        Regex::new(r"(?i)\b(\d+)\s+(?:documents?|docs?|files?|items?|entries)\b")
            .expect("limit pattern compiles"),
    ]
});

/// True when the question asks for a list of items.
pub fn is_enumeration_query(question: &str) -> bool {
    ENUMERATION_CUES.is_match(question)
}

/// True when the question is about the document collection itself.
pub fn is_catalog_query(question: &str) -> bool {
    CATALOG_CUES.is_match(question)
}

/// Requested number of items, e.g. 5 for "top 5" or "3 documents".
pub fn parse_list_limit(question: &str) -> Option<usize> {
    LIST_LIMITS
        .iter()
        .find_map(|re| re.captures(question))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .filter(|n: &usize| *n > 0)
}

/// Whether the requested items cover the whole collection ("all", "every").
pub fn wants_everything(question: &str) -> bool {
    let q = question.to_lowercase();
    q.split(|c: char| !c.is_alphanumeric())
        .any(|w| w == "all" || w == "every")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub file_id: String,
    pub name: String,
    pub url: Option<String>,
}

/// Distinct document names, sorted case-insensitively.
pub fn build_catalog(documents: &[Document]) -> Vec<CatalogEntry> {
    let mut by_name: BTreeMap<(String, String), CatalogEntry> = BTreeMap::new();
    for d in documents {
        let name = d.display_name.trim();
        if name.is_empty() {
            continue;
        }
        by_name
            .entry((name.to_lowercase(), name.to_string()))
            .or_insert_with(|| CatalogEntry {
                file_id: d.document_id.clone(),
                name: name.to_string(),
                url: d.web_url.clone(),
            });
    }
    by_name.into_values().collect()
}

/// Deterministic answer listing catalog entries.
pub fn catalog_answer(catalog: &[CatalogEntry], limit: Option<usize>) -> StructuredAnswer {
    let entries = match limit {
        Some(n) => &catalog[..n.min(catalog.len())],
        None => catalog,
    };
    if entries.is_empty() {
        return StructuredAnswer::refused(RefusalReason::NotInDocs, EMPTY_CATALOG_TEXT);
    }

    let answer = entries
        .iter()
        .map(|e| format!("- {}", e.name))
        .collect::<Vec<_>>()
        .join("\n");
    StructuredAnswer {
        answer,
        refused: false,
        refusal_reason: RefusalReason::Unknown,
        answer_style: AnswerStyle::Bullets,
        entities: entries.iter().map(|e| e.name.clone()).collect(),
        citations: entries
            .iter()
            .map(|e| Citation {
                file_id: e.file_id.clone(),
                file_name: e.name.clone(),
                snippets: e.url.iter().cloned().collect(),
            })
            .collect(),
    }
}

/// Whether a synthesized answer to an enumeration question should be
/// replaced by the catalog.
///
/// Applies when the answer is degenerate, or when the question asks for
/// everything and the answer lists fewer items than the catalog holds. A
/// refusal stands unless the question is about the collection itself.
pub fn needs_catalog_fallback(
    question: &str,
    answer: &StructuredAnswer,
    catalog_len: usize,
) -> bool {
    if answer.refused {
        return is_catalog_query(question);
    }
    if answer.is_degenerate() {
        return true;
    }
    is_catalog_query(question)
        && wants_everything(question)
        && answer.bullet_count() < catalog_len
}
