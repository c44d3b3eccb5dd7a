//! Embedding providers and the chunk-and-embed stage.
//!
//! Providers implement [`groundwork_core::embedding::Embedder`]:
//! - **[`DisabledEmbedder`]**: no vectors; retrieval runs on BM25 alone.
//! - **[`OpenAiEmbedder`]**: `POST {url}/v1/embeddings`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama.
//! - **`LocalEmbedder`**: fastembed models run in-process (feature
//!   `local-embeddings-fastembed`).
//!
//! [`create_embedder`] wraps the provider in a [`CallGuard`], so every batch
//! has a timeout, one immediate retry and a bounded number of calls in flight.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use groundwork_core::chunk::{chunk_pages, ChunkParams};
use groundwork_core::embedding::Embedder;
use groundwork_core::llm::ModelError;
use groundwork_core::models::Chunk;

use crate::adapter::NormalizedDocument;
use crate::config::EmbeddingConfig;
use crate::llm::CallGuard;

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Err(ModelError::Disabled)
    }
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json(
            &self.client,
            &format!("{}/v1/embeddings", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        check_batch(vectors, texts.len(), self.dims)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ModelError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ModelError::Malformed("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ModelError::Malformed("missing embedding".to_string()))?;
        indexed.push((index, to_f32(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json(
            &self.client,
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
        )
        .await
        .map_err(|e| match e {
            ModelError::Upstream(msg) => ModelError::Upstream(format!(
                "{} (is Ollama running at {}?)",
                msg, self.url
            )),
            other => other,
        })?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ModelError::Malformed("missing embeddings array".to_string()))?;
        let vectors = embeddings
            .iter()
            .map(|e| {
                e.as_array()
                    .map(|a| to_f32(a))
                    .ok_or_else(|| ModelError::Malformed("embedding is not an array".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        check_batch(vectors, texts.len(), self.dims)
    }
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let name = self.model_name.clone();
        let slot = Arc::clone(&self.model);
        let batch_size = self.batch_size;
        let texts = texts.to_vec();
        let expected = texts.len();

        // Model load and inference are CPU-bound; keep them off the runtime.
        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| ModelError::Upstream("local model lock poisoned".to_string()))?;
            if guard.is_none() {
                let which = config_to_fastembed_model(&name)
                    .map_err(|e| ModelError::Upstream(e.to_string()))?;
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(which).with_show_download_progress(false),
                )
                .map_err(|e| {
                    ModelError::Upstream(format!("failed to initialize local model: {}", e))
                })?;
                *guard = Some(model);
            }
            match guard.as_mut() {
                Some(model) => model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| ModelError::Upstream(format!("local embedding failed: {}", e))),
                None => Err(ModelError::Upstream("local model unavailable".to_string())),
            }
        })
        .await
        .map_err(|e| ModelError::Upstream(format!("embedding task failed: {}", e)))??;

        check_batch(vectors, expected, self.dims)
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, \
             multilingual-e5-large",
            other
        ),
    }
}

// ============ Shared helpers ============

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value, ModelError> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| ModelError::Upstream(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ModelError::Upstream(format!(
            "embedding API error {}: {}",
            status,
            body_text.chars().take(300).collect::<String>()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| ModelError::Malformed(e.to_string()))
}

fn to_f32(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// A batch must have one vector per input, each of the configured size.
fn check_batch(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, ModelError> {
    if vectors.len() != expected {
        return Err(ModelError::Malformed(format!(
            "expected {} vectors, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(ModelError::Malformed(format!(
            "expected {} dimensions, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(vectors)
}

/// An [`Embedder`] wrapped in a [`CallGuard`].
pub struct GuardedEmbedder {
    inner: Arc<dyn Embedder>,
    guard: CallGuard,
}

impl GuardedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, guard: CallGuard) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl Embedder for GuardedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let inner = &self.inner;
        self.guard
            .call("embedding batch", move || inner.embed(texts))
            .await
    }
}

/// Create the configured embedder, guarded.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let inner: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => Arc::new(DisabledEmbedder),
        "openai" => Arc::new(OpenAiEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    };
    let guard = CallGuard::new(
        config.max_in_flight,
        Duration::from_secs(config.timeout_secs),
    );
    Ok(Arc::new(GuardedEmbedder::new(inner, guard)))
}

// ============ Chunk and embed ============

/// Chunks of one document, with the batches that could not be embedded.
#[derive(Debug, Default)]
pub struct EmbeddedChunks {
    pub chunks: Vec<Chunk>,
    pub drafted: usize,
    pub failed_batches: Vec<ModelError>,
}

/// Split a normalized document into windows and embed them in batches.
///
/// Each batch is all-or-nothing: a failed batch drops exactly its own
/// chunks and nothing else. With the disabled embedder every chunk is kept
/// with an empty vector, so BM25 still finds it.
pub async fn chunk_and_embed(
    doc: &NormalizedDocument,
    params: &ChunkParams,
    embedder: &dyn Embedder,
    batch_size: usize,
) -> EmbeddedChunks {
    let drafts = chunk_pages(&doc.document, &doc.pages, params);
    let mut out = EmbeddedChunks {
        drafted: drafts.len(),
        ..Default::default()
    };
    let name = doc.document.display_name.as_str();
    let tenant = doc.document.tenant_id.as_str();

    if embedder.dims() == 0 {
        out.chunks = drafts
            .into_iter()
            .map(|d| Chunk::from_draft(d, tenant, name, Vec::new()))
            .collect();
        return out;
    }

    let mut drafts = drafts.into_iter().peekable();
    while drafts.peek().is_some() {
        let batch: Vec<_> = drafts.by_ref().take(batch_size.max(1)).collect();
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        match embedder.embed(&texts).await {
            Ok(vectors) => out.chunks.extend(
                batch
                    .into_iter()
                    .zip(vectors)
                    .map(|(d, v)| Chunk::from_draft(d, tenant, name, v)),
            ),
            Err(e) => {
                tracing::warn!(
                    document = %name,
                    chunks = texts.len(),
                    error = %e,
                    "embedding batch failed"
                );
                out.failed_batches.push(e);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork_core::models::{Document, ExtractionMethod, NormalizedPage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        fail_call: Option<usize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.fail_call {
                return Err(ModelError::Upstream("boom".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn doc_with_pages(n: u32) -> NormalizedDocument {
        NormalizedDocument {
            document: Document {
                tenant_id: "t1".into(),
                document_id: "d1".into(),
                display_name: "Handbook.pdf".into(),
                mime_type: "application/pdf".into(),
                revision_id: "r1".into(),
                page_count: Some(n),
                web_url: None,
            },
            pages: (1..=n)
                .map(|p| NormalizedPage {
                    page_number: p,
                    text: format!("page {} text", p),
                    method: ExtractionMethod::DigitalText,
                    confidence: None,
                })
                .collect(),
            skipped: vec![],
        }
    }

    #[tokio::test]
    async fn failed_batch_drops_only_its_chunks() {
        let embedder = CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_call: Some(1),
        };
        let out = chunk_and_embed(&doc_with_pages(5), &ChunkParams::default(), &embedder, 2).await;
        assert_eq!(out.drafted, 5);
        assert_eq!(out.chunks.len(), 3);
        assert_eq!(out.failed_batches.len(), 1);
        let pages: Vec<u32> = out.chunks.iter().map(|c| c.key.page_number).collect();
        assert_eq!(pages, vec![1, 2, 5]);
        assert!(out.chunks.iter().all(|c| c.tenant_id == "t1"));
    }

    #[tokio::test]
    async fn disabled_embedder_keeps_chunks_without_vectors() {
        let out = chunk_and_embed(
            &doc_with_pages(2),
            &ChunkParams::default(),
            &DisabledEmbedder,
            8,
        )
        .await;
        assert_eq!(out.chunks.len(), 2);
        assert!(out.chunks.iter().all(|c| c.embedding.is_empty()));
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn short_batches_are_malformed() {
        assert!(check_batch(vec![vec![1.0]], 2, 1).is_err());
        assert!(check_batch(vec![vec![1.0, 2.0]], 1, 1).is_err());
        assert!(check_batch(vec![vec![1.0]], 1, 1).is_ok());
    }
}
