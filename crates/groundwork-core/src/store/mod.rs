//! Index storage abstraction.
//!
//! The [`IndexStore`] trait is the only way the pipelines touch persisted
//! chunks. One physical index is shared by all tenants, so every read is
//! scoped by `tenant_id` and chunk keys are unique per tenant.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](IndexStore::upsert) | Insert or replace one chunk by key |
//! | [`delete`](IndexStore::delete) | Remove one chunk by key |
//! | [`delete_by_document`](IndexStore::delete_by_document) | Remove a document and all its chunks |
//! | [`replace_document`](IndexStore::replace_document) | Atomically swap a document's chunk set |
//! | [`vector_search`](IndexStore::vector_search) | Cosine similarity over one tenant |
//! | [`lexical_search`](IndexStore::lexical_search) | BM25 over one tenant's corpus |
//! | [`upsert_document`](IndexStore::upsert_document) | Record catalog metadata |
//! | [`list_documents`](IndexStore::list_documents) | Tenant document catalog |
//! | [`chunk_keys`](IndexStore::chunk_keys) | Enumerate stored keys |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Document};

/// A chunk returned from vector or lexical search, with its raw score.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_key: String,
    pub tenant_id: String,
    pub document_id: String,
    pub source_document_name: String,
    pub page_number: u32,
    pub text: String,
    /// Cosine similarity or BM25 score, depending on the search.
    pub raw_score: f64,
}

/// Outcome of [`IndexStore::replace_document`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub upserted: usize,
    /// Chunks of the document whose keys were not in the new set.
    pub removed: usize,
}

/// Violations that indicate a bug, never a transient condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexConsistencyError {
    #[error("chunk {chunk_key} belongs to tenant {found}, expected {expected}")]
    TenantMismatch {
        chunk_key: String,
        expected: String,
        found: String,
    },
    #[error("duplicate chunk key {0} in one write")]
    DuplicateKey(String),
    #[error("chunk {chunk_key} does not belong to document {document_id}")]
    ForeignChunk {
        chunk_key: String,
        document_id: String,
    },
}

/// Check that a document write only contains that document's chunks, for the
/// document's tenant, with no repeated keys.
pub fn validate_document_write(
    document: &Document,
    chunks: &[Chunk],
) -> Result<(), IndexConsistencyError> {
    let mut seen = std::collections::HashSet::new();
    for chunk in chunks {
        let key = chunk.key.to_string();
        if chunk.tenant_id != document.tenant_id {
            return Err(IndexConsistencyError::TenantMismatch {
                chunk_key: key,
                expected: document.tenant_id.clone(),
                found: chunk.tenant_id.clone(),
            });
        }
        if chunk.key.document_id != document.document_id {
            return Err(IndexConsistencyError::ForeignChunk {
                chunk_key: key,
                document_id: document.document_id.clone(),
            });
        }
        if !seen.insert(key.clone()) {
            return Err(IndexConsistencyError::DuplicateKey(key));
        }
    }
    Ok(())
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert a chunk, or replace the stored chunk with the same key.
    ///
    /// Upserting identical content is observably a no-op.
    async fn upsert(&self, chunk: &Chunk) -> Result<()>;

    /// Remove one chunk. Returns whether it existed.
    async fn delete(&self, tenant_id: &str, chunk_key: &str) -> Result<bool>;

    /// Remove a document's catalog entry and all of its chunks.
    /// Returns the number of chunks removed.
    async fn delete_by_document(&self, tenant_id: &str, document_id: &str) -> Result<usize>;

    /// Record the document and make `chunks` its complete chunk set.
    ///
    /// Stored chunks of the document whose keys are not in `chunks` (older
    /// revisions, superseded extraction methods, pages that vanished) are
    /// deleted in the same atomic step, so a concurrent search sees either
    /// the old set or the new one.
    async fn replace_document(&self, document: &Document, chunks: &[Chunk])
        -> Result<ReplaceSummary>;

    /// Top `k` chunks of `tenant_id` by cosine similarity to `query_vec`.
    async fn vector_search(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Top `k` chunks of `tenant_id` by BM25 over that tenant's chunks.
    async fn lexical_search(
        &self,
        tenant_id: &str,
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Insert or update a document's catalog metadata.
    async fn upsert_document(&self, document: &Document) -> Result<()>;

    /// All documents of a tenant, ordered by `document_id`.
    async fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>>;

    /// Stored chunk keys of a tenant, optionally for one document, sorted.
    async fn chunk_keys(&self, tenant_id: &str, document_id: Option<&str>) -> Result<Vec<String>>;
}

/// Sort candidates by score (desc), then key (asc), and keep the top `k`.
pub fn rank_candidates(mut candidates: Vec<ChunkCandidate>, k: usize) -> Vec<ChunkCandidate> {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_key.cmp(&b.chunk_key))
    });
    candidates.truncate(k);
    candidates
}
