//! Hybrid retriever.
//!
//! Retrieval operates entirely through the [`IndexStore`] trait. The caller
//! embeds the query and passes the vector in; when no vector is available
//! the retriever degrades to lexical-only ranking.
//!
//! # Fusion
//!
//! 1. Fetch `top_k × candidate_multiplier` vector candidates (cosine).
//! 2. Fetch the same number of lexical candidates (BM25 over the tenant).
//! 3. Normalize: cosine is clamped to `[0, 1]`; BM25 is min-max normalized
//!    within the lexical set.
//! 4. Fuse: `α × vector + (1 - α) × lexical`, plus `overlap_boost` for a
//!    chunk present in both sets.
//! 5. Drop candidates under the mode's relevance cutoff.
//! 6. Sort by fused score (desc), raw vector score (desc), chunk key (asc).
//! 7. Truncate to `top_k` and assign 1-based ranks.
//!
//! Enumeration mode raises `top_k` to at least `enumeration_top_k` and uses
//! the looser `enumeration_min_relevance` cutoff.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::bm25;
use crate::models::RetrievalCandidate;
use crate::store::{ChunkCandidate, IndexConsistencyError, IndexStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Default,
    Enumeration,
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    /// Weight of the vector signal: `fused = α·vector + (1-α)·lexical`.
    pub hybrid_alpha: f64,
    /// Added to the fused score of chunks found by both searches.
    pub overlap_boost: f64,
    /// Each search fetches `top_k × candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    pub min_relevance: f64,
    pub enumeration_top_k: usize,
    pub enumeration_min_relevance: f64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            hybrid_alpha: 0.6,
            overlap_boost: 0.1,
            candidate_multiplier: 4,
            min_relevance: 0.25,
            enumeration_top_k: 30,
            enumeration_min_relevance: 0.0,
        }
    }
}

/// Bundles all inputs for a single retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveRequest<'a> {
    pub tenant_id: &'a str,
    pub query: &'a str,
    /// Pre-computed query embedding. `None` means lexical only.
    pub query_vec: Option<&'a [f32]>,
    pub top_k: usize,
    pub mode: RetrievalMode,
    pub params: &'a RetrievalParams,
}

/// Retrieve fused, deduplicated candidates for one tenant.
///
/// Returns an empty list, not an error, when nothing matches.
pub async fn retrieve<S: IndexStore + ?Sized>(
    store: &S,
    req: &RetrieveRequest<'_>,
) -> Result<Vec<RetrievalCandidate>> {
    if req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let (top_k, cutoff) = match req.mode {
        RetrievalMode::Default => (req.top_k, req.params.min_relevance),
        RetrievalMode::Enumeration => (
            req.top_k.max(req.params.enumeration_top_k),
            req.params.enumeration_min_relevance,
        ),
    };
    if top_k == 0 {
        return Ok(Vec::new());
    }
    let fetch_k = top_k.saturating_mul(req.params.candidate_multiplier.max(1));

    let vector_candidates = match req.query_vec {
        Some(qv) => store.vector_search(req.tenant_id, qv, fetch_k).await?,
        None => Vec::new(),
    };
    let terms = bm25::tokenize(req.query);
    let lexical_candidates = if terms.is_empty() {
        Vec::new()
    } else {
        store.lexical_search(req.tenant_id, &terms, fetch_k).await?
    };

    ensure_tenant(req.tenant_id, &vector_candidates)?;
    ensure_tenant(req.tenant_id, &lexical_candidates)?;

    let alpha = if req.query_vec.is_some() {
        req.params.hybrid_alpha
    } else {
        0.0
    };

    let mut merged = fuse(
        &vector_candidates,
        &lexical_candidates,
        alpha,
        req.params.overlap_boost,
    );
    merged.retain(|c| c.fused_score >= cutoff);
    sort_candidates(&mut merged);
    merged.truncate(top_k);
    for (i, c) in merged.iter_mut().enumerate() {
        c.rank = i + 1;
    }
    Ok(merged)
}

/// Merge both candidate sets by chunk key and compute fused scores.
pub fn fuse(
    vector: &[ChunkCandidate],
    lexical: &[ChunkCandidate],
    alpha: f64,
    overlap_boost: f64,
) -> Vec<RetrievalCandidate> {
    let lexical_norm = normalize_scores(lexical);

    let mut by_key: BTreeMap<&str, (Option<&ChunkCandidate>, Option<(&ChunkCandidate, f64)>)> =
        BTreeMap::new();
    for c in vector {
        by_key.entry(c.chunk_key.as_str()).or_default().0 = Some(c);
    }
    for (c, norm) in lexical_norm {
        by_key.entry(c.chunk_key.as_str()).or_default().1 = Some((c, norm));
    }

    by_key
        .into_values()
        .filter_map(|(v, l)| {
            let base = v.or(l.map(|(c, _)| c))?;
            let vector_score = v.map_or(0.0, |c| c.raw_score);
            let lexical_score = l.map_or(0.0, |(c, _)| c.raw_score);
            let v_norm = vector_score.clamp(0.0, 1.0);
            let l_norm = l.map_or(0.0, |(_, n)| n);
            let boost = if v.is_some() && l.is_some() {
                overlap_boost
            } else {
                0.0
            };
            Some(RetrievalCandidate {
                chunk_key: base.chunk_key.clone(),
                tenant_id: base.tenant_id.clone(),
                document_id: base.document_id.clone(),
                source_document_name: base.source_document_name.clone(),
                page_number: base.page_number,
                text: base.text.clone(),
                vector_score,
                lexical_score,
                fused_score: alpha * v_norm + (1.0 - alpha) * l_norm + boost,
                rank: 0,
            })
        })
        .collect()
}

/// Deterministic order: fused desc, vector desc, chunk key asc.
pub fn sort_candidates(candidates: &mut [RetrievalCandidate]) {
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.vector_score
                    .partial_cmp(&a.vector_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.chunk_key.cmp(&b.chunk_key))
    });
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

fn ensure_tenant(tenant_id: &str, candidates: &[ChunkCandidate]) -> Result<(), IndexConsistencyError> {
    match candidates.iter().find(|c| c.tenant_id != tenant_id) {
        Some(c) => Err(IndexConsistencyError::TenantMismatch {
            chunk_key: c.chunk_key.clone(),
            expected: tenant_id.to_string(),
            found: c.tenant_id.clone(),
        }),
        None => Ok(()),
    }
}
