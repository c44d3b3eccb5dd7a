//! BM25 lexical scoring.
//!
//! Scoring is computed over whatever corpus the caller passes in. Index
//! stores pass exactly one tenant's chunks, so document frequencies and
//! average lengths never include another tenant's text.

use std::collections::{HashMap, HashSet};

/// Term-frequency saturation.
pub const K1: f64 = 1.2;
/// Length normalization.
pub const B: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "me", "my", "of", "on", "or", "our", "that", "the", "their", "there",
    "this", "to", "was", "we", "what", "when", "where", "which", "who", "why", "with", "you",
    "your",
];

/// Lowercased alphanumeric terms, stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Score every document of `corpus` against `query_terms`.
///
/// Returns `(position_in_corpus, score)` for documents with a positive
/// score, highest first. Ties keep corpus order.
pub fn score<S: AsRef<str>>(query_terms: &[String], corpus: &[S]) -> Vec<(usize, f64)> {
    let query: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    if query.is_empty() || corpus.is_empty() {
        return Vec::new();
    }

    let docs: Vec<Vec<String>> = corpus.iter().map(|d| tokenize(d.as_ref())).collect();
    let n = docs.len() as f64;
    let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f64 / n;

    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for terms in &docs {
        let unique: HashSet<&str> = terms
            .iter()
            .map(String::as_str)
            .filter(|t| query.contains(t))
            .collect();
        for t in unique {
            *doc_freq.entry(t).or_default() += 1;
        }
    }

    let mut scored: Vec<(usize, f64)> = docs
        .iter()
        .enumerate()
        .filter_map(|(pos, terms)| {
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for t in terms.iter().map(String::as_str).filter(|t| query.contains(t)) {
                *tf.entry(t).or_default() += 1;
            }
            if tf.is_empty() {
                return None;
            }
            let len_norm = if avg_len > 0.0 {
                terms.len() as f64 / avg_len
            } else {
                1.0
            };
            let total: f64 = tf
                .iter()
                .map(|(term, &f)| {
                    let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let f = f as f64;
                    idf * (f * (K1 + 1.0)) / (f + K1 * (1.0 - B + B * len_norm))
                })
                .sum();
            Some((pos, total))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored
}
