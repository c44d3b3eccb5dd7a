//! SQLite-backed [`IndexStore`] implementation.
//!
//! Chunks of all tenants share one `chunks` table keyed by
//! `(tenant_id, chunk_key)`. Every query filters on `tenant_id`; there is no
//! statement in this file that reads chunks without it.
//!
//! Vector search is a brute-force cosine scan over the tenant's embeddings.
//! Lexical search scores the tenant's chunk texts with BM25, so document
//! frequencies never include another tenant's corpus.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use groundwork_core::bm25;
use groundwork_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use groundwork_core::models::{Chunk, Document};
use groundwork_core::store::{
    rank_candidates, validate_document_write, ChunkCandidate, IndexStore, ReplaceSummary,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const UPSERT_CHUNK: &str = r#"
    INSERT INTO chunks (tenant_id, chunk_key, document_id, revision_id, page_number,
                        method, chunk_index, source_document_name, text, hash,
                        confidence, embedding, dims)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(tenant_id, chunk_key) DO UPDATE SET
        source_document_name = excluded.source_document_name,
        text = excluded.text,
        hash = excluded.hash,
        confidence = excluded.confidence,
        embedding = excluded.embedding,
        dims = excluded.dims
"#;

const UPSERT_DOCUMENT: &str = r#"
    INSERT INTO documents (tenant_id, document_id, display_name, mime_type,
                           revision_id, page_count, web_url, indexed_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(tenant_id, document_id) DO UPDATE SET
        display_name = excluded.display_name,
        mime_type = excluded.mime_type,
        revision_id = excluded.revision_id,
        page_count = excluded.page_count,
        web_url = excluded.web_url,
        indexed_at = excluded.indexed_at
"#;

async fn write_chunk<'e, E>(executor: E, chunk: &Chunk) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(UPSERT_CHUNK)
        .bind(&chunk.tenant_id)
        .bind(chunk.key.to_string())
        .bind(&chunk.key.document_id)
        .bind(&chunk.key.revision_id)
        .bind(chunk.key.page_number as i64)
        .bind(chunk.key.method.as_str())
        .bind(chunk.key.chunk_index as i64)
        .bind(&chunk.source_document_name)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(chunk.confidence.map(|c| c as f64))
        .bind(vec_to_blob(&chunk.embedding))
        .bind(chunk.embedding.len() as i64)
        .execute(executor)
        .await?;
    Ok(())
}

async fn write_document<'e, E>(executor: E, doc: &Document) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(UPSERT_DOCUMENT)
        .bind(&doc.tenant_id)
        .bind(&doc.document_id)
        .bind(&doc.display_name)
        .bind(&doc.mime_type)
        .bind(&doc.revision_id)
        .bind(doc.page_count.map(|p| p as i64))
        .bind(&doc.web_url)
        .bind(chrono::Utc::now().timestamp())
        .execute(executor)
        .await?;
    Ok(())
}

fn candidate_from_row(row: &SqliteRow, raw_score: f64) -> ChunkCandidate {
    let page: i64 = row.get("page_number");
    ChunkCandidate {
        chunk_key: row.get("chunk_key"),
        tenant_id: row.get("tenant_id"),
        document_id: row.get("document_id"),
        source_document_name: row.get("source_document_name"),
        page_number: page as u32,
        text: row.get("text"),
        raw_score,
    }
}

fn document_from_row(row: &SqliteRow) -> Document {
    let page_count: Option<i64> = row.get("page_count");
    Document {
        tenant_id: row.get("tenant_id"),
        document_id: row.get("document_id"),
        display_name: row.get("display_name"),
        mime_type: row.get("mime_type"),
        revision_id: row.get("revision_id"),
        page_count: page_count.map(|p| p as u32),
        web_url: row.get("web_url"),
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        write_chunk(&self.pool, chunk).await
    }

    async fn delete(&self, tenant_id: &str, chunk_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND chunk_key = ?")
            .bind(tenant_id)
            .bind(chunk_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_document(&self, tenant_id: &str, document_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND document_id = ?")
            .bind(tenant_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM documents WHERE tenant_id = ? AND document_id = ?")
            .bind(tenant_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn replace_document(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<ReplaceSummary> {
        validate_document_write(document, chunks)?;

        let mut tx = self.pool.begin().await?;

        write_document(&mut *tx, document).await?;

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT chunk_key FROM chunks WHERE tenant_id = ? AND document_id = ?",
        )
        .bind(&document.tenant_id)
        .bind(&document.document_id)
        .fetch_all(&mut *tx)
        .await?;

        let incoming: std::collections::HashSet<String> =
            chunks.iter().map(|c| c.key.to_string()).collect();

        let mut removed = 0;
        for key in existing.iter().filter(|k| !incoming.contains(*k)) {
            sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND chunk_key = ?")
                .bind(&document.tenant_id)
                .bind(key)
                .execute(&mut *tx)
                .await?;
            removed += 1;
        }

        for chunk in chunks {
            write_chunk(&mut *tx, chunk).await?;
        }

        tx.commit().await?;

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
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, chunk_key, document_id, source_document_name, page_number,
                   text, embedding
            FROM chunks
            WHERE tenant_id = ? AND dims = ?
            "#,
        )
        .bind(tenant_id)
        .bind(query_vec.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                candidate_from_row(row, score)
            })
            .collect();

        Ok(rank_candidates(candidates, k))
    }

    async fn lexical_search(
        &self,
        tenant_id: &str,
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT tenant_id, chunk_key, document_id, source_document_name, page_number, text
            FROM chunks
            WHERE tenant_id = ?
            ORDER BY chunk_key
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let texts: Vec<String> = rows.iter().map(|r| r.get::<String, _>("text")).collect();
        let candidates = bm25::score(query_terms, &texts)
            .into_iter()
            .map(|(pos, score)| candidate_from_row(&rows[pos], score))
            .collect();

        Ok(rank_candidates(candidates, k))
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        write_document(&self.pool, document).await
    }

    async fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, document_id, display_name, mime_type, revision_id,
                   page_count, web_url
            FROM documents
            WHERE tenant_id = ?
            ORDER BY document_id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn chunk_keys(&self, tenant_id: &str, document_id: Option<&str>) -> Result<Vec<String>> {
        let keys = match document_id {
            Some(doc) => {
                sqlx::query_scalar(
                    "SELECT chunk_key FROM chunks WHERE tenant_id = ? AND document_id = ? ORDER BY chunk_key",
                )
                .bind(tenant_id)
                .bind(doc)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT chunk_key FROM chunks WHERE tenant_id = ? ORDER BY chunk_key",
                )
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use groundwork_core::chunk_key::ChunkKey;
    use groundwork_core::models::ExtractionMethod;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteStore {
        let config: Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("t.sqlite").display()
        ))
        .unwrap();
        SqliteStore::new(crate::db::open(&config).await.unwrap())
    }

    fn doc(tenant: &str, id: &str, rev: &str) -> Document {
        Document {
            tenant_id: tenant.into(),
            document_id: id.into(),
            display_name: format!("{}.pdf", id),
            mime_type: "application/pdf".into(),
            revision_id: rev.into(),
            page_count: Some(2),
            web_url: None,
        }
    }

    fn chunk(tenant: &str, id: &str, rev: &str, page: u32, text: &str, v: Vec<f32>) -> Chunk {
        Chunk {
            key: ChunkKey::new(id, rev, page, ExtractionMethod::DigitalText, 0),
            tenant_id: tenant.into(),
            text: text.into(),
            hash: groundwork_core::chunk::hash_text(text),
            embedding: v,
            confidence: None,
            source_document_name: format!("{}.pdf", id),
        }
    }

    #[tokio::test]
    async fn replace_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        let d = doc("t1", "d1", "r1");
        let chunks = vec![
            chunk("t1", "d1", "r1", 1, "alpha", vec![1.0, 0.0]),
            chunk("t1", "d1", "r1", 2, "beta", vec![0.0, 1.0]),
        ];

        s.replace_document(&d, &chunks).await.unwrap();
        let first = s.chunk_keys("t1", None).await.unwrap();
        let summary = s.replace_document(&d, &chunks).await.unwrap();
        let second = s.chunk_keys("t1", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(summary.removed, 0);
    }

    #[tokio::test]
    async fn new_revision_replaces_old_chunks() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        s.replace_document(
            &doc("t1", "d1", "r1"),
            &[chunk("t1", "d1", "r1", 1, "old text", vec![1.0, 0.0])],
        )
        .await
        .unwrap();

        let summary = s
            .replace_document(
                &doc("t1", "d1", "r2"),
                &[chunk("t1", "d1", "r2", 1, "new text", vec![1.0, 0.0])],
            )
            .await
            .unwrap();

        assert_eq!(summary.removed, 1);
        let keys = s.chunk_keys("t1", Some("d1")).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].contains("#rev:r2#"));
    }

    #[tokio::test]
    async fn searches_never_cross_tenants() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        s.replace_document(
            &doc("a", "d1", "r1"),
            &[chunk("a", "d1", "r1", 1, "quarterly revenue report", vec![1.0, 0.0])],
        )
        .await
        .unwrap();
        s.replace_document(
            &doc("b", "d1", "r1"),
            &[chunk("b", "d1", "r1", 1, "quarterly revenue forecast", vec![1.0, 0.0])],
        )
        .await
        .unwrap();

        let vec_hits = s.vector_search("a", &[1.0, 0.0], 10).await.unwrap();
        let lex_hits = s
            .lexical_search("a", &bm25::tokenize("quarterly revenue"), 10)
            .await
            .unwrap();

        assert_eq!(vec_hits.len(), 1);
        assert_eq!(lex_hits.len(), 1);
        assert!(vec_hits.iter().chain(&lex_hits).all(|c| c.tenant_id == "a"));
    }

    #[tokio::test]
    async fn delete_by_document_cascades() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        s.replace_document(
            &doc("t1", "d1", "r1"),
            &[
                chunk("t1", "d1", "r1", 1, "one", vec![1.0]),
                chunk("t1", "d1", "r1", 2, "two", vec![1.0]),
            ],
        )
        .await
        .unwrap();

        assert_eq!(s.delete_by_document("t1", "d1").await.unwrap(), 2);
        assert!(s.chunk_keys("t1", None).await.unwrap().is_empty());
        assert!(s.list_documents("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_chunk_of_other_tenant() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        let result = s
            .replace_document(
                &doc("a", "d1", "r1"),
                &[chunk("b", "d1", "r1", 1, "x", vec![1.0])],
            )
            .await;
        assert!(result.is_err());
        assert!(s.chunk_keys("b", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_delete_reports_existence() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        let c = chunk("t1", "d1", "r1", 1, "x", vec![1.0]);
        s.upsert(&c).await.unwrap();
        assert!(s.delete("t1", &c.key.to_string()).await.unwrap());
        assert!(!s.delete("t1", &c.key.to_string()).await.unwrap());
    }
}
