//! Listwise LLM reranking.
//!
//! The top candidates from retrieval are numbered and shown to the model in
//! one call; the model returns a relevance score per passage. Candidates
//! are reordered by that score, with retrieval rank breaking ties, and
//! passages the model scored at zero are dropped. A failed or unparseable
//! call leaves the retrieval order untouched.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

use crate::answer::extract_json;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::models::RetrievalCandidate;

/// Hard ceiling on candidates sent to the model.
pub const MAX_RERANK_CANDIDATES: usize = 50;

/// Passage text is truncated to this many characters in the prompt.
const PASSAGE_CHARS: usize = 800;

const RERANK_SYSTEM: &str = "You judge how well passages answer a question. \
Score every passage from 0.0 (irrelevant) to 1.0 (directly answers). \
Reply with JSON: {\"scores\": [{\"index\": <passage number>, \"score\": <0.0-1.0>}]}.";

#[derive(Deserialize)]
struct RerankReply {
    scores: Vec<PassageScore>,
}

#[derive(Deserialize)]
struct PassageScore {
    index: usize,
    score: f64,
}

pub fn rerank_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "scores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": { "type": "integer" },
                        "score": { "type": "number" }
                    },
                    "required": ["index", "score"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["scores"],
        "additionalProperties": false
    })
}

pub fn rerank_request(question: &str, candidates: &[RetrievalCandidate]) -> CompletionRequest {
    let mut prompt = format!("Question: {}\n\nPassages:\n", question);
    for (i, c) in candidates.iter().enumerate() {
        let text: String = c.text.chars().take(PASSAGE_CHARS).collect();
        prompt.push_str(&format!(
            "[{}] ({}, page {})\n{}\n\n",
            i + 1,
            c.source_document_name,
            c.page_number,
            text
        ));
    }
    CompletionRequest::new(RERANK_SYSTEM, prompt).with_schema("passage_scores", rerank_schema())
}

/// Parse per-passage scores keyed by 1-based passage number.
pub fn parse_scores(raw: &str, passages: usize) -> Option<HashMap<usize, f64>> {
    let reply: RerankReply = serde_json::from_str(extract_json(raw)?).ok()?;
    let scores: HashMap<usize, f64> = reply
        .scores
        .into_iter()
        .filter(|s| s.index >= 1 && s.index <= passages && s.score.is_finite())
        .map(|s| (s.index, s.score.clamp(0.0, 1.0)))
        .collect();
    (!scores.is_empty()).then_some(scores)
}

/// Reorder `candidates` by model-judged relevance.
///
/// Only the first `top_n` (at most [`MAX_RERANK_CANDIDATES`]) are sent and
/// returned. Unscored passages keep their retrieval rank after scored ones.
pub async fn rerank(
    llm: &dyn LanguageModel,
    question: &str,
    mut candidates: Vec<RetrievalCandidate>,
    top_n: usize,
) -> Vec<RetrievalCandidate> {
    candidates.truncate(top_n.min(MAX_RERANK_CANDIDATES));
    if candidates.len() < 2 {
        return candidates;
    }

    let raw = match llm.complete(&rerank_request(question, &candidates)).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "rerank call failed, keeping retrieval order");
            return candidates;
        }
    };
    let Some(scores) = parse_scores(&raw, candidates.len()) else {
        tracing::warn!("rerank reply unparseable, keeping retrieval order");
        return candidates;
    };

    apply_scores(candidates, &scores)
}

/// Sort by model score (desc), then retrieval order; drop zero-scored passages.
pub fn apply_scores(
    candidates: Vec<RetrievalCandidate>,
    scores: &HashMap<usize, f64>,
) -> Vec<RetrievalCandidate> {
    let mut scored: Vec<(Option<f64>, usize, RetrievalCandidate)> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| (scores.get(&(i + 1)).copied(), i, c))
        .filter(|(s, _, _)| s.map_or(true, |s| s > 0.0))
        .collect();
    scored.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => y
            .partial_cmp(&x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.1.cmp(&b.1),
    });
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (_, _, mut c))| {
            c.rank = i + 1;
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(key: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_key: key.into(),
            tenant_id: "t".into(),
            document_id: key.into(),
            source_document_name: format!("{}.pdf", key),
            page_number: 1,
            text: format!("text of {}", key),
            vector_score: 0.0,
            lexical_score: 0.0,
            fused_score: 0.0,
            rank: 0,
        }
    }

    #[test]
    fn parses_scores_and_ignores_out_of_range_indices() {
        let raw = r#"{"scores":[{"index":1,"score":0.2},{"index":2,"score":1.7},{"index":9,"score":0.5}]}"#;
        let scores = parse_scores(raw, 2).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[&2], 1.0);
    }

    #[test]
    fn unparseable_reply_yields_none() {
        assert!(parse_scores("no idea", 3).is_none());
        assert!(parse_scores(r#"{"scores":[]}"#, 3).is_none());
    }

    #[test]
    fn reorders_by_score_and_drops_zeros() {
        let candidates = vec![cand("a"), cand("b"), cand("c"), cand("d")];
        let scores = HashMap::from([(1, 0.3), (2, 0.0), (3, 0.9)]);
        let out = apply_scores(candidates, &scores);
        let keys: Vec<&str> = out.iter().map(|c| c.chunk_key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "d"]);
        assert_eq!(out[0].rank, 1);
        assert_eq!(out[2].rank, 3);
    }

    #[test]
    fn prompt_numbers_passages_from_one() {
        let req = rerank_request("q", &[cand("a"), cand("b")]);
        assert!(req.prompt.contains("[1] (a.pdf, page 1)"));
        assert!(req.prompt.contains("[2] (b.pdf, page 1)"));
        assert!(req.schema.is_some());
    }
}
