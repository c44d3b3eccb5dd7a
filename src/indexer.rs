//! The per-tenant indexing job.
//!
//! ```text
//! PENDING ──trigger──▶ INDEXING ──▶ READY
//!                          │          │
//!                          ▼          │ trigger
//!                       FAILED ◀──────┘ (both re-enter INDEXING)
//! ```
//!
//! Entry to INDEXING requires the tenant's lease (see [`crate::ledger`]).
//! A trigger that cannot take the lease is rejected with
//! [`RejectReason::AlreadyRunning`], never queued. Manual rebuilds, resets
//! and the scheduler all go through [`Indexer::trigger_rebuild`] /
//! [`Indexer::rebuild`], which share one code path.
//!
//! Per-document failures are recorded and skipped. The run ends READY when
//! at least one document succeeded (or the source is empty), FAILED when
//! none did, when credentials are rejected, or when the index reports a
//! consistency violation. With `indexing.require_all_documents` any failed
//! document makes the run FAILED.
//!
//! [`Indexer::cancel`] revokes the lease of a running job and records it as
//! FAILED. A job that finds its lease gone stops before the next document
//! and leaves the status alone.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use groundwork_core::chunk::ChunkParams;
use groundwork_core::embedding::Embedder;
use groundwork_core::models::{IndexingState, IndexingStatus};
use groundwork_core::store::{IndexConsistencyError, IndexStore};

use crate::adapter::{DocumentAdapter, DocumentError};
use crate::config::Config;
use crate::connector::{
    build_source, listing_checksum, DocumentSelector, DocumentSource, RetryPolicy, SourceFile,
};
use crate::embedding::chunk_and_embed;
use crate::ledger;
use crate::ocr::OcrEngine;

pub const MSG_COMPLETE: &str = "Indexing complete! You can now chat with your documents.";
pub const MSG_EMPTY: &str = "No documents found. Add files to your source and re-index.";
pub const MSG_ABANDONED: &str = "Indexing timed out or server restarted";
pub const MSG_CANCELLED: &str = "Indexing was cancelled";

/// Knobs for the job, taken from `[indexing]`, `[chunking]`, `[embedding]`
/// and `[ocr]`.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub chunking: ChunkParams,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub min_text_chars: usize,
    pub lease_ttl: Duration,
    pub heartbeat: Duration,
    pub require_all_documents: bool,
}

impl IndexerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.params(),
            batch_size: config.embedding.batch_size,
            retry: RetryPolicy::from_config(config),
            min_text_chars: config.ocr.min_text_chars,
            lease_ttl: Duration::from_secs(config.indexing.lease_ttl_secs),
            heartbeat: Duration::from_secs(config.indexing.heartbeat_secs),
            require_all_documents: config.indexing.require_all_documents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyRunning,
    UnknownTenant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted { job_id: String },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotRunning,
    UnknownTenant,
}

/// How a rebuild treats what is already indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildMode {
    /// Re-index changed documents in place; remove vanished ones.
    Incremental,
    /// Remove everything the tenant has indexed, then index from scratch.
    Reset,
}

struct TenantEntry {
    source: Arc<dyn DocumentSource>,
    selector: DocumentSelector,
}

pub struct Indexer {
    pool: SqlitePool,
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    ocr: Arc<dyn OcrEngine>,
    settings: IndexerSettings,
    tenants: HashMap<String, TenantEntry>,
    /// Lost-lease flags of the jobs this process is running, by tenant.
    running: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// Held for the duration of one job.
struct Lease {
    tenant_id: String,
    holder: String,
    lost: Arc<AtomicBool>,
}

impl Indexer {
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        ocr: Arc<dyn OcrEngine>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            pool,
            store,
            embedder,
            ocr,
            settings,
            tenants: HashMap::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Build an indexer with every configured tenant registered.
    pub fn from_config(
        config: &Config,
        pool: SqlitePool,
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        let mut indexer = Self::new(pool, store, embedder, ocr, IndexerSettings::from_config(config));
        for tenant in &config.tenants {
            indexer.register(
                &tenant.id,
                build_source(config, tenant),
                DocumentSelector::for_tenant(tenant),
            );
        }
        indexer
    }

    /// Attach a source to a tenant, with the selection used when a caller
    /// does not pass one.
    pub fn register(
        &mut self,
        tenant_id: &str,
        source: Arc<dyn DocumentSource>,
        selector: DocumentSelector,
    ) {
        self.tenants
            .insert(tenant_id.to_string(), TenantEntry { source, selector });
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn default_selector(&self, tenant_id: &str) -> Option<DocumentSelector> {
        self.tenants.get(tenant_id).map(|t| t.selector.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn adapter(&self, source: Arc<dyn DocumentSource>) -> DocumentAdapter {
        DocumentAdapter::new(
            source,
            Arc::clone(&self.ocr),
            self.settings.retry,
            self.settings.min_text_chars,
        )
    }

    // ─── Status ─────────────────────────────────────────────────────────

    /// Current status. An INDEXING status whose lease has expired belongs to
    /// a job that died; it is moved to FAILED here so pollers stop waiting.
    pub async fn get_status(&self, tenant_id: &str) -> Result<IndexingStatus> {
        let mut status = ledger::load_status(&self.pool, tenant_id).await?;
        if status.state == IndexingState::Indexing {
            let live = ledger::lease_is_live(&self.pool, tenant_id, self.settings.lease_ttl).await?;
            if ledger::is_abandoned(&status, live) {
                tracing::warn!(tenant = %tenant_id, "abandoned indexing run detected");
                status.state = IndexingState::Failed;
                status.message = MSG_ABANDONED.to_string();
                status.error_detail = Some(MSG_ABANDONED.to_string());
                status.completed_at = Some(Utc::now());
                ledger::save_status(&self.pool, &status).await?;
            }
        }
        Ok(status)
    }

    // ─── Triggers ───────────────────────────────────────────────────────

    /// Start a rebuild in the background.
    pub async fn trigger_rebuild(
        self: &Arc<Self>,
        tenant_id: &str,
        selector: &DocumentSelector,
    ) -> Result<TriggerOutcome> {
        self.trigger(tenant_id, selector, RebuildMode::Incremental).await
    }

    /// Wipe the tenant's index and rebuild it in the background.
    pub async fn trigger_reset(
        self: &Arc<Self>,
        tenant_id: &str,
        selector: &DocumentSelector,
    ) -> Result<TriggerOutcome> {
        self.trigger(tenant_id, selector, RebuildMode::Reset).await
    }

    async fn trigger(
        self: &Arc<Self>,
        tenant_id: &str,
        selector: &DocumentSelector,
        mode: RebuildMode,
    ) -> Result<TriggerOutcome> {
        let lease = match self.begin(tenant_id, selector).await? {
            Ok(lease) => lease,
            Err(reason) => return Ok(TriggerOutcome::Rejected { reason }),
        };
        let job_id = lease.holder.clone();

        let this = Arc::clone(self);
        let selector = selector.clone();
        tokio::spawn(async move {
            this.run_guarded(lease, selector, mode).await;
        });

        Ok(TriggerOutcome::Accepted { job_id })
    }

    /// Run a rebuild to completion and return the final status.
    pub async fn rebuild(
        self: &Arc<Self>,
        tenant_id: &str,
        selector: &DocumentSelector,
        mode: RebuildMode,
    ) -> Result<std::result::Result<IndexingStatus, RejectReason>> {
        let lease = match self.begin(tenant_id, selector).await? {
            Ok(lease) => lease,
            Err(reason) => return Ok(Err(reason)),
        };
        self.run_guarded(lease, selector.clone(), mode).await;
        Ok(Ok(ledger::load_status(&self.pool, tenant_id).await?))
    }

    /// Take the lease and move the tenant into INDEXING.
    async fn begin(
        &self,
        tenant_id: &str,
        selector: &DocumentSelector,
    ) -> Result<std::result::Result<Lease, RejectReason>> {
        if !self.tenants.contains_key(tenant_id) {
            return Ok(Err(RejectReason::UnknownTenant));
        }

        let holder = uuid::Uuid::new_v4().to_string();
        if !ledger::acquire_lease(&self.pool, tenant_id, &holder, self.settings.lease_ttl).await? {
            tracing::info!(tenant = %tenant_id, "rebuild rejected, already running");
            return Ok(Err(RejectReason::AlreadyRunning));
        }

        if let Err(e) = self.mark_indexing(tenant_id, selector).await {
            if let Err(release) = ledger::release_lease(&self.pool, tenant_id, &holder).await {
                tracing::error!(tenant = %tenant_id, error = %release, "could not release lease");
            }
            return Err(e);
        }

        let lost = Arc::new(AtomicBool::new(false));
        if let Ok(mut running) = self.running.lock() {
            running.insert(tenant_id.to_string(), Arc::clone(&lost));
        }
        Ok(Ok(Lease {
            tenant_id: tenant_id.to_string(),
            holder,
            lost,
        }))
    }

    /// Stop the tenant's running job and record it as cancelled. The lease
    /// is revoked at once, so a new rebuild can start while the old job
    /// winds down.
    pub async fn cancel(&self, tenant_id: &str) -> Result<CancelOutcome> {
        if !self.tenants.contains_key(tenant_id) {
            return Ok(CancelOutcome::UnknownTenant);
        }
        let status = self.get_status(tenant_id).await?;
        if status.state != IndexingState::Indexing {
            return Ok(CancelOutcome::NotRunning);
        }

        if let Some(lost) = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(tenant_id).cloned())
        {
            lost.store(true, Ordering::SeqCst);
        }
        ledger::revoke_lease(&self.pool, tenant_id).await?;
        self.finish_failed(tenant_id, MSG_CANCELLED, MSG_CANCELLED, status.document_count)
            .await?;
        tracing::info!(tenant = %tenant_id, documents = status.document_count, "indexing cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Record the INDEXING state for a run that holds the lease.
    async fn mark_indexing(&self, tenant_id: &str, selector: &DocumentSelector) -> Result<()> {
        let fingerprint = selector.fingerprint();
        let previous = ledger::selector_fingerprint(&self.pool, tenant_id).await?;
        let mut status = ledger::load_status(&self.pool, tenant_id).await?;
        if previous.is_some_and(|p| p != fingerprint) {
            // A different selection is a different corpus.
            tracing::info!(tenant = %tenant_id, "document selection changed, resetting status");
            ledger::clear_status(&self.pool, tenant_id).await?;
            status = IndexingStatus::pending(tenant_id);
        }

        status.state = IndexingState::Indexing;
        status.progress = 0;
        status.document_count = 0;
        status.error_detail = None;
        status.message = "Connecting to document source...".to_string();
        status.started_at = Some(Utc::now());
        status.completed_at = None;
        ledger::save_status(&self.pool, &status).await?;
        ledger::set_selector_fingerprint(&self.pool, tenant_id, &fingerprint).await
    }

    /// Run the job with a heartbeat, and release the lease however it ends.
    async fn run_guarded(self: &Arc<Self>, lease: Lease, selector: DocumentSelector, mode: RebuildMode) {
        let heartbeat = {
            let pool = self.pool.clone();
            let tenant = lease.tenant_id.clone();
            let holder = lease.holder.clone();
            let lost = Arc::clone(&lease.lost);
            let every = self.settings.heartbeat;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match ledger::renew_lease(&pool, &tenant, &holder).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::error!(tenant = %tenant, "indexing lease lost");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => tracing::warn!(tenant = %tenant, error = %e, "heartbeat failed"),
                    }
                }
            })
        };

        let job = {
            let this = Arc::clone(self);
            let tenant = lease.tenant_id.clone();
            let lost = Arc::clone(&lease.lost);
            tokio::spawn(async move { this.run(&tenant, &selector, mode, &lost).await })
        };

        let outcome = job.await;
        heartbeat.abort();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(join) => Some(format!("indexing task crashed: {}", join)),
        };
        if let Some(detail) = failure {
            if lease.lost.load(Ordering::SeqCst) {
                // Whoever revoked or took over the lease owns the status now.
                tracing::info!(tenant = %lease.tenant_id, error = %detail, "indexing stopped");
            } else {
                tracing::error!(tenant = %lease.tenant_id, error = %detail, "indexing failed");
                if let Err(e) = self.finish_failed(&lease.tenant_id, "Indexing failed", &detail, 0).await {
                    tracing::error!(tenant = %lease.tenant_id, error = %e, "could not record failure");
                }
            }
        }

        if let Ok(mut running) = self.running.lock() {
            if running
                .get(&lease.tenant_id)
                .is_some_and(|flag| Arc::ptr_eq(flag, &lease.lost))
            {
                running.remove(&lease.tenant_id);
            }
        }
        if let Err(e) = ledger::release_lease(&self.pool, &lease.tenant_id, &lease.holder).await {
            tracing::warn!(tenant = %lease.tenant_id, error = %e, "could not release lease");
        }
    }

    // ─── Job body ───────────────────────────────────────────────────────

    async fn run(
        &self,
        tenant_id: &str,
        selector: &DocumentSelector,
        mode: RebuildMode,
        lost: &AtomicBool,
    ) -> Result<()> {
        let entry = self
            .tenants
            .get(tenant_id)
            .ok_or_else(|| anyhow::anyhow!("tenant {} is not registered", tenant_id))?;
        let adapter = self.adapter(Arc::clone(&entry.source));

        if mode == RebuildMode::Reset {
            let mut removed = 0;
            for doc in self.store.list_documents(tenant_id).await? {
                removed += self.store.delete_by_document(tenant_id, &doc.document_id).await?;
            }
            tracing::info!(tenant = %tenant_id, removed, "reset cleared the index");
        }

        tracing::info!(tenant = %tenant_id, source = entry.source.kind(), "listing documents");
        let files = match adapter.list(selector).await {
            Ok(files) => files,
            Err(e) => {
                ensure_held(lost)?;
                let message = if e.is_fatal() {
                    "Indexing failed: source credentials are invalid or expired"
                } else {
                    "Indexing failed: could not list documents"
                };
                return self.finish_failed(tenant_id, message, &e.to_string(), 0).await;
            }
        };
        ensure_held(lost)?;
        let checksum = listing_checksum(&files);

        self.remove_vanished(tenant_id, &files).await?;

        if files.is_empty() {
            tracing::info!(tenant = %tenant_id, "source is empty");
            self.finish_ready(tenant_id, 0, MSG_EMPTY, None).await?;
            ledger::set_source_checksum(&self.pool, tenant_id, &checksum).await?;
            return Ok(());
        }

        let total = files.len();
        ledger::update_progress(
            &self.pool,
            tenant_id,
            10,
            0,
            &format!("Processing {} documents...", total),
        )
        .await?;

        let mut succeeded: u64 = 0;
        let mut failures: Vec<(String, String)> = Vec::new();

        for (i, file) in files.iter().enumerate() {
            ensure_held(lost)?;

            match self.index_one(tenant_id, &adapter, file).await {
                Ok(()) => succeeded += 1,
                Err(DocumentFailure::Fatal(detail)) => {
                    return self
                        .finish_failed(
                            tenant_id,
                            "Indexing failed: source credentials are invalid or expired",
                            &detail,
                            succeeded,
                        )
                        .await;
                }
                Err(DocumentFailure::Consistency(e)) => return Err(e.into()),
                Err(DocumentFailure::Skipped(reason)) => {
                    tracing::warn!(
                        tenant = %tenant_id,
                        document = %file.display_name,
                        error = %reason,
                        "document failed, continuing"
                    );
                    failures.push((file.display_name.clone(), reason));
                }
            }

            let progress = 10 + ((i + 1) * 85 / total) as u8;
            ledger::update_progress(
                &self.pool,
                tenant_id,
                progress,
                succeeded,
                &format!("Indexed {} of {} documents...", i + 1, total),
            )
            .await?;
        }

        ensure_held(lost)?;
        let detail = failure_detail(&failures, total);
        if succeeded == 0 {
            return self
                .finish_failed(
                    tenant_id,
                    "Indexing failed: no document could be indexed",
                    detail.as_deref().unwrap_or("no documents succeeded"),
                    0,
                )
                .await;
        }
        if self.settings.require_all_documents && !failures.is_empty() {
            return self
                .finish_failed(
                    tenant_id,
                    "Indexing failed: some documents could not be indexed",
                    detail.as_deref().unwrap_or_default(),
                    succeeded,
                )
                .await;
        }

        self.finish_ready(tenant_id, succeeded, MSG_COMPLETE, detail).await?;
        ledger::set_source_checksum(&self.pool, tenant_id, &checksum).await?;
        tracing::info!(
            tenant = %tenant_id,
            documents = succeeded,
            failed = failures.len(),
            "indexing complete"
        );
        Ok(())
    }

    async fn index_one(
        &self,
        tenant_id: &str,
        adapter: &DocumentAdapter,
        file: &SourceFile,
    ) -> std::result::Result<(), DocumentFailure> {
        let doc = match adapter.fetch_and_normalize(tenant_id, file).await {
            Ok(doc) => doc,
            Err(e @ DocumentError::Source(_)) if e.is_fatal() => {
                return Err(DocumentFailure::Fatal(e.to_string()))
            }
            Err(e) => return Err(DocumentFailure::Skipped(e.to_string())),
        };

        let embedded = chunk_and_embed(
            &doc,
            &self.settings.chunking,
            self.embedder.as_ref(),
            self.settings.batch_size,
        )
        .await;

        // A partial write would delete stored chunks of the failed batches,
        // so the document keeps whatever was indexed before.
        if let Some(first) = embedded.failed_batches.first() {
            return Err(DocumentFailure::Skipped(format!(
                "embedding failed for {} of {} chunks: {}",
                embedded.drafted - embedded.chunks.len(),
                embedded.drafted,
                first
            )));
        }
        if embedded.chunks.is_empty() {
            return Err(DocumentFailure::Skipped(
                "document has no indexable text".to_string(),
            ));
        }
        if !doc.skipped.is_empty() {
            tracing::info!(
                tenant = %tenant_id,
                document = %file.display_name,
                skipped_pages = doc.skipped.len(),
                "indexed with skipped pages"
            );
        }

        match self.store.replace_document(&doc.document, &embedded.chunks).await {
            Ok(summary) => {
                tracing::debug!(
                    tenant = %tenant_id,
                    document = %file.display_name,
                    upserted = summary.upserted,
                    removed = summary.removed,
                    "document written"
                );
                Ok(())
            }
            Err(e) => match e.downcast::<IndexConsistencyError>() {
                Ok(violation) => {
                    tracing::error!(error = %violation, "index consistency violation");
                    Err(DocumentFailure::Consistency(violation))
                }
                Err(other) => Err(DocumentFailure::Skipped(format!("index write failed: {}", other))),
            },
        }
    }

    /// Delete indexed documents that are no longer in the source listing.
    async fn remove_vanished(&self, tenant_id: &str, files: &[SourceFile]) -> Result<()> {
        let listed: HashSet<&str> = files.iter().map(|f| f.document_id.as_str()).collect();
        for doc in self.store.list_documents(tenant_id).await? {
            if !listed.contains(doc.document_id.as_str()) {
                let removed = self.store.delete_by_document(tenant_id, &doc.document_id).await?;
                tracing::info!(
                    tenant = %tenant_id,
                    document = %doc.display_name,
                    removed,
                    "removed document no longer in source"
                );
            }
        }
        Ok(())
    }

    async fn finish_ready(
        &self,
        tenant_id: &str,
        document_count: u64,
        message: &str,
        error_detail: Option<String>,
    ) -> Result<()> {
        let mut status = ledger::load_status(&self.pool, tenant_id).await?;
        status.state = IndexingState::Ready;
        status.progress = 100;
        status.document_count = document_count;
        status.message = message.to_string();
        status.error_detail = error_detail;
        status.completed_at = Some(Utc::now());
        ledger::save_status(&self.pool, &status).await
    }

    async fn finish_failed(
        &self,
        tenant_id: &str,
        message: &str,
        detail: &str,
        document_count: u64,
    ) -> Result<()> {
        let mut status = ledger::load_status(&self.pool, tenant_id).await?;
        status.state = IndexingState::Failed;
        status.document_count = document_count;
        status.message = message.to_string();
        status.error_detail = Some(detail.to_string());
        status.completed_at = Some(Utc::now());
        ledger::save_status(&self.pool, &status).await
    }

    /// Whether the source listing differs from the one last indexed.
    /// A listing that cannot be fetched counts as changed.
    pub async fn source_changed(&self, tenant_id: &str, selector: &DocumentSelector) -> Result<bool> {
        let Some(entry) = self.tenants.get(tenant_id) else {
            return Ok(false);
        };
        let stored = ledger::source_checksum(&self.pool, tenant_id).await?;
        let current = match self.adapter(Arc::clone(&entry.source)).list(selector).await {
            Ok(files) => listing_checksum(&files),
            Err(e) => {
                tracing::warn!(tenant = %tenant_id, error = %e, "change check failed");
                return Ok(true);
            }
        };
        Ok(stored.as_deref() != Some(current.as_str()))
    }
}

enum DocumentFailure {
    /// Ends the run: no later document can succeed.
    Fatal(String),
    /// A correctness violation in the index.
    Consistency(IndexConsistencyError),
    /// Recorded; the run continues.
    Skipped(String),
}

/// Fail the job once its lease has been revoked or taken over.
fn ensure_held(lost: &AtomicBool) -> Result<()> {
    if lost.load(Ordering::SeqCst) {
        anyhow::bail!("indexing lease was revoked or lost to another worker");
    }
    Ok(())
}

fn failure_detail(failures: &[(String, String)], total: usize) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    let list = failures
        .iter()
        .map(|(name, reason)| format!("{}: {}", name, reason))
        .collect::<Vec<_>>()
        .join("; ");
    Some(format!(
        "{} of {} documents failed: {}",
        failures.len(),
        total,
        list
    ))
}
