//! Core data types shared by the indexing and query pipelines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk_key::ChunkKey;

/// How the text of a page was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    DigitalText,
    Ocr,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::DigitalText => "digital_text",
            ExtractionMethod::Ocr => "ocr",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "digital_text" => Ok(ExtractionMethod::DigitalText),
            "ocr" => Ok(ExtractionMethod::Ocr),
            other => Err(format!("unknown extraction method: {}", other)),
        }
    }
}

/// A logical source document owned by one tenant.
///
/// `document_id` is the source's stable file identifier and never changes
/// across revisions; `revision_id` is the source's opaque version token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub tenant_id: String,
    pub document_id: String,
    pub display_name: String,
    pub mime_type: String,
    pub revision_id: String,
    /// `None` when the format is not paginated.
    pub page_count: Option<u32>,
    /// Browsable link used for citations, when the source has one.
    pub web_url: Option<String>,
}

/// One page of normalized text produced by the document store adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPage {
    /// 1-based page number. Unpaginated formats use page 1.
    pub page_number: u32,
    pub text: String,
    pub method: ExtractionMethod,
    /// OCR confidence in `[0, 1]`; `None` for digital text.
    pub confidence: Option<f32>,
}

/// A page that could not be read. Recorded, never fatal for the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPage {
    pub page_number: u32,
    pub error: String,
}

/// A windowed slice of a page, ready to be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub key: ChunkKey,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub confidence: Option<f32>,
}

/// A retrievable, embedded unit of text belonging to exactly one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub key: ChunkKey,
    pub tenant_id: String,
    pub text: String,
    pub hash: String,
    pub embedding: Vec<f32>,
    pub confidence: Option<f32>,
    /// Denormalized for citation display.
    pub source_document_name: String,
}

impl Chunk {
    pub fn from_draft(
        draft: ChunkDraft,
        tenant_id: &str,
        source_document_name: &str,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            key: draft.key,
            tenant_id: tenant_id.to_string(),
            text: draft.text,
            hash: draft.hash,
            embedding,
            confidence: draft.confidence,
            source_document_name: source_document_name.to_string(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.key.document_id
    }
}

/// Lifecycle of a tenant's knowledge index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexingState {
    Pending,
    Indexing,
    Ready,
    Failed,
}

impl IndexingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingState::Pending => "PENDING",
            IndexingState::Indexing => "INDEXING",
            IndexingState::Ready => "READY",
            IndexingState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IndexingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(IndexingState::Pending),
            "INDEXING" => Ok(IndexingState::Indexing),
            "READY" => Ok(IndexingState::Ready),
            "FAILED" => Ok(IndexingState::Failed),
            other => Err(format!("unknown indexing state: {}", other)),
        }
    }
}

/// Per-tenant indexing progress, as seen by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub tenant_id: String,
    pub state: IndexingState,
    /// 0 to 100.
    pub progress: u8,
    pub message: String,
    /// Documents successfully indexed by the current or last run.
    pub document_count: u64,
    pub error_detail: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IndexingStatus {
    /// Status of a tenant that has never been indexed.
    pub fn pending(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: IndexingState::Pending,
            progress: 0,
            message: "Not indexed yet".to_string(),
            document_count: 0,
            error_detail: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == IndexingState::Ready
    }
}

/// A fused retrieval hit. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalCandidate {
    pub chunk_key: String,
    pub tenant_id: String,
    pub document_id: String,
    pub source_document_name: String,
    pub page_number: u32,
    pub text: String,
    /// Raw cosine similarity, 0.0 when the chunk came only from lexical search.
    pub vector_score: f64,
    /// Raw BM25 score, 0.0 when the chunk came only from vector search.
    pub lexical_score: f64,
    pub fused_score: f64,
    /// 1-based position after fusion.
    pub rank: usize,
}
