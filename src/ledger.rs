//! Durable indexing status and the per-tenant rebuild lease.
//!
//! Both live in SQLite so every process sharing the database sees the same
//! state. The lease row is the mutual-exclusion primitive: a job may only
//! write chunks for a tenant while it holds that tenant's lease, and a lease
//! whose heartbeat is older than the TTL can be taken over.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use groundwork_core::models::{IndexingState, IndexingStatus};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_ms(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn status_from_row(row: &SqliteRow) -> Result<IndexingStatus> {
    let state: String = row.get("state");
    let progress: i64 = row.get("progress");
    let document_count: i64 = row.get("document_count");
    let updated_at: i64 = row.get("updated_at");
    Ok(IndexingStatus {
        tenant_id: row.get("tenant_id"),
        state: state.parse().map_err(anyhow::Error::msg)?,
        progress: progress.clamp(0, 100) as u8,
        message: row.get("message"),
        document_count: document_count.max(0) as u64,
        error_detail: row.get("error_detail"),
        started_at: from_ms(row.get("started_at")),
        completed_at: from_ms(row.get("completed_at")),
        updated_at: from_ms(Some(updated_at)).unwrap_or_else(Utc::now),
    })
}

/// Stored status, or a fresh PENDING status for an unknown tenant.
pub async fn load_status(pool: &SqlitePool, tenant_id: &str) -> Result<IndexingStatus> {
    let row = sqlx::query(
        r#"
        SELECT tenant_id, state, progress, message, document_count, error_detail,
               started_at, completed_at, updated_at
        FROM indexing_status WHERE tenant_id = ?
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => status_from_row(&row),
        None => Ok(IndexingStatus::pending(tenant_id)),
    }
}

pub async fn save_status(pool: &SqlitePool, status: &IndexingStatus) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO indexing_status (tenant_id, state, progress, message, document_count,
                                     error_detail, started_at, completed_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tenant_id) DO UPDATE SET
            state = excluded.state,
            progress = excluded.progress,
            message = excluded.message,
            document_count = excluded.document_count,
            error_detail = excluded.error_detail,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&status.tenant_id)
    .bind(status.state.as_str())
    .bind(status.progress as i64)
    .bind(&status.message)
    .bind(status.document_count as i64)
    .bind(&status.error_detail)
    .bind(to_ms(status.started_at))
    .bind(to_ms(status.completed_at))
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Move progress forward while a run is INDEXING. Progress never goes down
/// within a run.
pub async fn update_progress(
    pool: &SqlitePool,
    tenant_id: &str,
    progress: u8,
    document_count: u64,
    message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE indexing_status
        SET progress = MAX(progress, ?), document_count = ?, message = ?, updated_at = ?
        WHERE tenant_id = ? AND state = 'INDEXING'
        "#,
    )
    .bind(progress.min(100) as i64)
    .bind(document_count as i64)
    .bind(message)
    .bind(now_ms())
    .bind(tenant_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fingerprint of the document selection the last rebuild used.
pub async fn selector_fingerprint(pool: &SqlitePool, tenant_id: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT selector_fingerprint FROM indexing_status WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

pub async fn set_selector_fingerprint(
    pool: &SqlitePool,
    tenant_id: &str,
    fingerprint: &str,
) -> Result<()> {
    sqlx::query("UPDATE indexing_status SET selector_fingerprint = ? WHERE tenant_id = ?")
        .bind(fingerprint)
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Checksum of the source listing at the last successful rebuild.
pub async fn source_checksum(pool: &SqlitePool, tenant_id: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT source_checksum FROM indexing_status WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

pub async fn set_source_checksum(pool: &SqlitePool, tenant_id: &str, checksum: &str) -> Result<()> {
    sqlx::query("UPDATE indexing_status SET source_checksum = ? WHERE tenant_id = ?")
        .bind(checksum)
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Forget everything about a tenant's indexing history.
pub async fn clear_status(pool: &SqlitePool, tenant_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM indexing_status WHERE tenant_id = ?")
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─── Lease ──────────────────────────────────────────────────────────────

/// Take the tenant's lease for `holder`.
///
/// Succeeds when no lease exists or the existing one has not heartbeated
/// within `ttl`. The check and the write are one statement, so two callers
/// racing for the same tenant cannot both win.
pub async fn acquire_lease(
    pool: &SqlitePool,
    tenant_id: &str,
    holder: &str,
    ttl: Duration,
) -> Result<bool> {
    let now = now_ms();
    let stale_before = now - ttl.as_millis() as i64;
    let result = sqlx::query(
        r#"
        INSERT INTO index_leases (tenant_id, holder, acquired_at, heartbeat_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(tenant_id) DO UPDATE SET
            holder = excluded.holder,
            acquired_at = excluded.acquired_at,
            heartbeat_at = excluded.heartbeat_at
        WHERE index_leases.heartbeat_at < ?
        "#,
    )
    .bind(tenant_id)
    .bind(holder)
    .bind(now)
    .bind(now)
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Refresh the heartbeat. Returns false if `holder` no longer owns the lease.
pub async fn renew_lease(pool: &SqlitePool, tenant_id: &str, holder: &str) -> Result<bool> {
    let result =
        sqlx::query("UPDATE index_leases SET heartbeat_at = ? WHERE tenant_id = ? AND holder = ?")
            .bind(now_ms())
            .bind(tenant_id)
            .bind(holder)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn release_lease(pool: &SqlitePool, tenant_id: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM index_leases WHERE tenant_id = ? AND holder = ?")
        .bind(tenant_id)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove the tenant's lease whoever holds it. The holder's next
/// heartbeat finds the row gone and stops its job.
pub async fn revoke_lease(pool: &SqlitePool, tenant_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM index_leases WHERE tenant_id = ?")
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Whether some holder has heartbeated within `ttl`.
pub async fn lease_is_live(pool: &SqlitePool, tenant_id: &str, ttl: Duration) -> Result<bool> {
    let heartbeat: Option<i64> =
        sqlx::query_scalar("SELECT heartbeat_at FROM index_leases WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await?;
    Ok(heartbeat.is_some_and(|hb| hb >= now_ms() - ttl.as_millis() as i64))
}

/// True when the status says INDEXING but no live lease backs it.
pub fn is_abandoned(status: &IndexingStatus, lease_live: bool) -> bool {
    status.state == IndexingState::Indexing && !lease_live
}
