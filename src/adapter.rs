//! Fetch a source file and turn it into per-page text.
//!
//! The OCR decision is made page by page: a page whose digital text has
//! fewer than `min_text_chars` non-whitespace characters is sent to the OCR
//! engine, every other page keeps its digital text. A page that cannot be
//! read at all becomes a [`SkippedPage`]; the document only fails when no
//! page produced text.

use std::sync::Arc;

use groundwork_core::models::{Document, ExtractionMethod, NormalizedPage, SkippedPage};

use crate::connector::{with_retry, DocumentSelector, DocumentSource, RetryPolicy, SourceError, SourceFile};
use crate::extract::{self, text_density, ExtractionError, RawPage};
use crate::ocr::{OcrEngine, OcrInput};

/// A document ready for chunking.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    pub document: Document,
    /// Pages with text, in page order.
    pub pages: Vec<NormalizedPage>,
    pub skipped: Vec<SkippedPage>,
}

/// Why a whole document could not be normalized.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl DocumentError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DocumentError::Source(e) if e.is_fatal())
    }
}

pub struct DocumentAdapter {
    source: Arc<dyn DocumentSource>,
    ocr: Arc<dyn OcrEngine>,
    retry: RetryPolicy,
    min_text_chars: usize,
}

impl DocumentAdapter {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        ocr: Arc<dyn OcrEngine>,
        retry: RetryPolicy,
        min_text_chars: usize,
    ) -> Self {
        Self {
            source,
            ocr,
            retry,
            min_text_chars,
        }
    }

    pub async fn list(&self, selector: &DocumentSelector) -> Result<Vec<SourceFile>, SourceError> {
        let source = &self.source;
        with_retry(&self.retry, "list files", move || source.list_files(selector)).await
    }

    pub async fn fetch_and_normalize(
        &self,
        tenant_id: &str,
        file: &SourceFile,
    ) -> Result<NormalizedDocument, DocumentError> {
        if !extract::is_supported(&file.mime_type) {
            return Err(ExtractionError::UnsupportedContentType(file.mime_type.clone()).into());
        }

        let source = &self.source;
        let bytes = with_retry(&self.retry, "download", move || source.download(file)).await?;

        let mime = file.mime_type.clone();
        let bytes = Arc::new(bytes);
        let raw_pages = {
            let bytes = Arc::clone(&bytes);
            tokio::task::spawn_blocking(move || extract::extract_pages(&bytes, &mime))
                .await
                .map_err(|e| ExtractionError::Pdf(format!("extraction task panicked: {}", e)))??
        };

        let page_count = raw_pages.len() as u32;
        let mut pages = Vec::with_capacity(raw_pages.len());
        let mut skipped = Vec::new();

        for raw in raw_pages {
            match self.normalize_page(&bytes, &file.mime_type, raw).await {
                Ok(page) => pages.push(page),
                Err(skip) => {
                    tracing::warn!(
                        document = %file.display_name,
                        page = skip.page_number,
                        error = %skip.error,
                        "skipping page"
                    );
                    skipped.push(skip);
                }
            }
        }

        if pages.is_empty() {
            return Err(match skipped.first() {
                Some(s) if skipped.len() == 1 && page_count == 1 => {
                    ExtractionError::Ocr(s.error.clone()).into()
                }
                _ => ExtractionError::NoText.into(),
            });
        }

        Ok(NormalizedDocument {
            document: file.to_document(tenant_id, Some(page_count)),
            pages,
            skipped,
        })
    }

    async fn normalize_page(
        &self,
        bytes: &[u8],
        mime_type: &str,
        raw: RawPage,
    ) -> Result<NormalizedPage, SkippedPage> {
        if text_density(&raw.text) >= self.min_text_chars {
            return Ok(NormalizedPage {
                page_number: raw.page_number,
                text: raw.text,
                method: ExtractionMethod::DigitalText,
                confidence: None,
            });
        }

        // Plain-text formats have nothing to rasterize.
        let ocr_capable = extract::is_image(mime_type) || mime_type == extract::MIME_PDF;
        let ocr_result = if ocr_capable {
            self.ocr
                .recognize(OcrInput {
                    bytes,
                    mime_type,
                    page_number: raw.page_number,
                })
                .await
        } else {
            Err(ExtractionError::Ocr(format!("no OCR for {}", mime_type)))
        };

        match ocr_result {
            Ok(ocr) if text_density(&ocr.text) > 0 => Ok(NormalizedPage {
                page_number: raw.page_number,
                text: ocr.text,
                method: ExtractionMethod::Ocr,
                confidence: ocr.confidence,
            }),
            // Sparse digital text is still better than nothing.
            _ if text_density(&raw.text) > 0 => Ok(NormalizedPage {
                page_number: raw.page_number,
                text: raw.text,
                method: ExtractionMethod::DigitalText,
                confidence: None,
            }),
            Ok(_) => Err(SkippedPage {
                page_number: raw.page_number,
                error: "page has no recognizable text".to_string(),
            }),
            Err(e) => Err(SkippedPage {
                page_number: raw.page_number,
                error: e.to_string(),
            }),
        }
    }
}
