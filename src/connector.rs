//! Document sources.
//!
//! A [`DocumentSource`] lists a tenant's selected files and downloads their
//! bytes. Sources are bound to one tenant's credentials when built, so the
//! indexer never handles tokens directly.
//!
//! Transient failures (rate limits, 5xx, timeouts) are retried with capped
//! exponential backoff by [`with_retry`]. Everything else is returned to the
//! caller, which decides whether it is fatal to the run
//! ([`SourceError::is_fatal`]) or only to one document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use groundwork_core::models::Document;

use crate::config::{Config, TenantConfig, TenantSource};
use crate::connector_drive::DriveSource;
use crate::connector_fs::FilesystemSource;

/// Which files of a source make up a tenant's corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DocumentSelector {
    /// Everything the source exposes.
    All,
    /// One folder: a Drive folder id, or a path relative to a filesystem root.
    Folder(String),
    /// An explicit set of file ids.
    Files(Vec<String>),
}

impl DocumentSelector {
    pub fn for_tenant(tenant: &TenantConfig) -> Self {
        match &tenant.source {
            TenantSource::Filesystem { .. } => DocumentSelector::All,
            TenantSource::Drive {
                folder_id,
                file_ids,
                ..
            } => {
                if !file_ids.is_empty() {
                    DocumentSelector::Files(file_ids.clone())
                } else if let Some(folder) = folder_id {
                    DocumentSelector::Folder(folder.clone())
                } else {
                    DocumentSelector::All
                }
            }
        }
    }

    /// Stable digest, independent of file id order.
    pub fn fingerprint(&self) -> String {
        let canonical = match self {
            DocumentSelector::All => "all".to_string(),
            DocumentSelector::Folder(f) => format!("folder:{}", f),
            DocumentSelector::Files(ids) => {
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                format!("files:{}", ids.join(","))
            }
        };
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// One file as reported by a source listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub document_id: String,
    pub display_name: String,
    pub mime_type: String,
    /// Changes whenever the content changes.
    pub revision_id: String,
    pub web_url: Option<String>,
    pub size_bytes: Option<u64>,
}

impl SourceFile {
    pub fn to_document(&self, tenant_id: &str, page_count: Option<u32>) -> Document {
        Document {
            tenant_id: tenant_id.to_string(),
            document_id: self.document_id.clone(),
            display_name: self.display_name.clone(),
            mime_type: self.mime_type.clone(),
            revision_id: self.revision_id.clone(),
            page_count,
            web_url: self.web_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("credentials expired or invalid: {0}")]
    AuthExpired(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited(_) | SourceError::Transient(_))
    }

    /// Errors after which no other document of the run can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::AuthExpired(_))
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Short name for logs, e.g. `"filesystem"` or `"drive"`.
    fn kind(&self) -> &'static str;

    async fn list_files(&self, selector: &DocumentSelector) -> Result<Vec<SourceFile>, SourceError>;

    async fn download(&self, file: &SourceFile) -> Result<Vec<u8>, SourceError>;
}

/// Attempt count and backoff shape for source calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.source.download_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(config.source.backoff_cap_secs),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): 1s, 2s, 4s, ... capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << (retry.saturating_sub(1)).min(5);
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    attempts = policy.attempts,
                    error = %e,
                    ?delay,
                    "source call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Digest of a listing's `(id, revision)` pairs. Equal listings give equal
/// checksums regardless of order.
pub fn listing_checksum(files: &[SourceFile]) -> String {
    let mut pairs: Vec<String> = files
        .iter()
        .map(|f| format!("{}:{}", f.document_id, f.revision_id))
        .collect();
    pairs.sort();
    hex::encode(Sha256::digest(pairs.join("\n").as_bytes()))
}

/// Build the configured source for a tenant.
pub fn build_source(config: &Config, tenant: &TenantConfig) -> Arc<dyn DocumentSource> {
    match &tenant.source {
        TenantSource::Filesystem {
            root,
            include_globs,
            exclude_globs,
        } => Arc::new(FilesystemSource::new(
            root.clone(),
            include_globs.clone(),
            exclude_globs.clone(),
            config.source.max_file_bytes,
        )),
        TenantSource::Drive { token_env, .. } => {
            let token = std::env::var(token_env).ok().filter(|t| !t.trim().is_empty());
            Arc::new(DriveSource::new(token, token_env.clone(), &config.source))
        }
    }
}
