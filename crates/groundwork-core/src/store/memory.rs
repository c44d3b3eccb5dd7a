//! In-memory [`IndexStore`] implementation for tests and embedded use.
//!
//! All state sits behind a single `RwLock`, so a document replacement is
//! invisible to readers until it is complete. Vector search is brute-force
//! cosine similarity; lexical search runs BM25 over the tenant's chunks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::bm25;
use crate::embedding::cosine_similarity;
use crate::models::{Chunk, Document};

use super::{
    rank_candidates, validate_document_write, ChunkCandidate, IndexStore, ReplaceSummary,
};

#[derive(Default)]
struct Tables {
    /// `(tenant_id, document_id)` → document.
    documents: BTreeMap<(String, String), Document>,
    /// `(tenant_id, chunk_key)` → chunk.
    chunks: BTreeMap<(String, String), Chunk>,
}

/// In-memory store. Tenant scoping mirrors the SQLite schema.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn candidate(chunk: &Chunk, raw_score: f64) -> ChunkCandidate {
    ChunkCandidate {
        chunk_key: chunk.key.to_string(),
        tenant_id: chunk.tenant_id.clone(),
        document_id: chunk.key.document_id.clone(),
        source_document_name: chunk.source_document_name.clone(),
        page_number: chunk.key.page_number,
        text: chunk.text.clone(),
        raw_score,
    }
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        let mut tables = self.write()?;
        tables
            .chunks
            .insert((chunk.tenant_id.clone(), chunk.key.to_string()), chunk.clone());
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, chunk_key: &str) -> Result<bool> {
        let mut tables = self.write()?;
        Ok(tables
            .chunks
            .remove(&(tenant_id.to_string(), chunk_key.to_string()))
            .is_some())
    }

    async fn delete_by_document(&self, tenant_id: &str, document_id: &str) -> Result<usize> {
        let mut tables = self.write()?;
        tables
            .documents
            .remove(&(tenant_id.to_string(), document_id.to_string()));
        let before = tables.chunks.len();
        tables
            .chunks
            .retain(|(t, _), c| !(t == tenant_id && c.key.document_id == document_id));
        Ok(before - tables.chunks.len())
    }

    async fn replace_document(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<ReplaceSummary> {
        validate_document_write(document, chunks)?;

        let mut tables = self.write()?;
        tables.documents.insert(
            (document.tenant_id.clone(), document.document_id.clone()),
            document.clone(),
        );

        let incoming: HashMap<String, &Chunk> =
            chunks.iter().map(|c| (c.key.to_string(), c)).collect();
        let before = tables.chunks.len();
        tables.chunks.retain(|(t, key), c| {
            !(t == &document.tenant_id
                && c.key.document_id == document.document_id
                && !incoming.contains_key(key))
        });
        let removed = before - tables.chunks.len();

        for (key, chunk) in incoming {
            tables
                .chunks
                .insert((document.tenant_id.clone(), key), chunk.clone());
        }

        Ok(ReplaceSummary {
            upserted: chunks.len(),
            removed,
        })
    }

    async fn vector_search(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let tables = self.read()?;
        let candidates = tables
            .chunks
            .iter()
            .filter(|((t, _), c)| t == tenant_id && !c.embedding.is_empty())
            .map(|(_, c)| candidate(c, cosine_similarity(query_vec, &c.embedding) as f64))
            .collect();
        Ok(rank_candidates(candidates, k))
    }

    async fn lexical_search(
        &self,
        tenant_id: &str,
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let tables = self.read()?;
        let corpus: Vec<&Chunk> = tables
            .chunks
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, c)| c)
            .collect();
        let texts: Vec<&str> = corpus.iter().map(|c| c.text.as_str()).collect();
        let candidates = bm25::score(query_terms, &texts)
            .into_iter()
            .map(|(pos, s)| candidate(corpus[pos], s))
            .collect();
        Ok(rank_candidates(candidates, k))
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        let mut tables = self.write()?;
        tables.documents.insert(
            (document.tenant_id.clone(), document.document_id.clone()),
            document.clone(),
        );
        Ok(())
    }

    async fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>> {
        let tables = self.read()?;
        Ok(tables
            .documents
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn chunk_keys(&self, tenant_id: &str, document_id: Option<&str>) -> Result<Vec<String>> {
        let tables = self.read()?;
        Ok(tables
            .chunks
            .iter()
            .filter(|((t, _), c)| {
                t == tenant_id && document_id.map_or(true, |d| c.key.document_id == d)
            })
            .map(|((_, key), _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_key::ChunkKey;
    use crate::models::ExtractionMethod;

    fn doc(tenant: &str, id: &str, rev: &str) -> Document {
        Document {
            tenant_id: tenant.into(),
            document_id: id.into(),
            display_name: format!("{}.pdf", id),
            mime_type: "application/pdf".into(),
            revision_id: rev.into(),
            page_count: Some(1),
            web_url: None,
        }
    }

    fn chunk(tenant: &str, id: &str, rev: &str, idx: u32, text: &str, v: Vec<f32>) -> Chunk {
        Chunk {
            key: ChunkKey::new(id, rev, 1, ExtractionMethod::DigitalText, idx),
            tenant_id: tenant.into(),
            text: text.into(),
            hash: crate::chunk::hash_text(text),
            embedding: v,
            confidence: None,
            source_document_name: format!("{}.pdf", id),
        }
    }

    #[tokio::test]
    async fn upsert_same_key_twice_keeps_one_row() {
        let store = InMemoryStore::new();
        let c = chunk("t1", "doc1", "r1", 0, "hello", vec![1.0, 0.0]);
        store.upsert(&c).await.unwrap();
        store.upsert(&c).await.unwrap();
        assert_eq!(
            store.chunk_keys("t1", None).await.unwrap(),
            vec!["doc1#rev:r1#p:1#m:digital_text#c:0"]
        );
    }

    #[tokio::test]
    async fn searches_never_cross_tenants() {
        let store = InMemoryStore::new();
        let a = chunk("a", "shared", "r1", 0, "secret merger plans", vec![1.0, 0.0]);
        let b = chunk("b", "shared", "r1", 0, "secret merger plans", vec![1.0, 0.0]);
        store.replace_document(&doc("a", "shared", "r1"), &[a]).await.unwrap();
        store.replace_document(&doc("b", "shared", "r1"), &[b]).await.unwrap();

        let vec_hits = store.vector_search("a", &[1.0, 0.0], 10).await.unwrap();
        let lex_hits = store
            .lexical_search("a", &bm25::tokenize("merger"), 10)
            .await
            .unwrap();
        assert_eq!(vec_hits.len(), 1);
        assert_eq!(lex_hits.len(), 1);
        assert!(vec_hits.iter().chain(&lex_hits).all(|c| c.tenant_id == "a"));
    }

    #[tokio::test]
    async fn replace_document_drops_stale_revision() {
        let store = InMemoryStore::new();
        store
            .replace_document(
                &doc("t1", "doc1", "r1"),
                &[
                    chunk("t1", "doc1", "r1", 0, "old one", vec![1.0]),
                    chunk("t1", "doc1", "r1", 1, "old two", vec![1.0]),
                ],
            )
            .await
            .unwrap();
        let summary = store
            .replace_document(
                &doc("t1", "doc1", "r2"),
                &[chunk("t1", "doc1", "r2", 0, "new", vec![1.0])],
            )
            .await
            .unwrap();
        assert_eq!(summary.removed, 2);
        let keys = store.chunk_keys("t1", Some("doc1")).await.unwrap();
        assert_eq!(keys, vec!["doc1#rev:r2#p:1#m:digital_text#c:0"]);
    }

    #[tokio::test]
    async fn replace_document_rejects_foreign_tenant_chunk() {
        let store = InMemoryStore::new();
        let err = store
            .replace_document(
                &doc("t1", "doc1", "r1"),
                &[chunk("t2", "doc1", "r1", 0, "x", vec![1.0])],
            )
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<super::super::IndexConsistencyError>().is_some());
        assert!(store.chunk_keys("t1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_document_cascades() {
        let store = InMemoryStore::new();
        store
            .replace_document(
                &doc("t1", "doc1", "r1"),
                &[
                    chunk("t1", "doc1", "r1", 0, "a", vec![1.0]),
                    chunk("t1", "doc1", "r1", 1, "b", vec![1.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.delete_by_document("t1", "doc1").await.unwrap(), 2);
        assert!(store.list_documents("t1").await.unwrap().is_empty());
        assert!(store.chunk_keys("t1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_single_chunk() {
        let store = InMemoryStore::new();
        let c = chunk("t1", "doc1", "r1", 0, "a", vec![1.0]);
        store.upsert(&c).await.unwrap();
        assert!(store.delete("t1", &c.key.to_string()).await.unwrap());
        assert!(!store.delete("t1", &c.key.to_string()).await.unwrap());
    }
}
