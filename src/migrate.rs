use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to call repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Catalog metadata, one row per (tenant, document).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            tenant_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            revision_id TEXT NOT NULL,
            page_count INTEGER,
            web_url TEXT,
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, document_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            tenant_id TEXT NOT NULL,
            chunk_key TEXT NOT NULL,
            document_id TEXT NOT NULL,
            revision_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            method TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            source_document_name TEXT NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            confidence REAL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, chunk_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_status (
            tenant_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            document_count INTEGER NOT NULL DEFAULT 0,
            error_detail TEXT,
            selector_fingerprint TEXT,
            source_checksum TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one live row per tenant; see ledger::acquire_lease.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_leases (
            tenant_id TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(tenant_id, document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
