//! Shared fixtures: an in-memory document source, a scripted language
//! model, a deterministic embedder and a SQLite-backed harness.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::Notify;

use groundwork::assistant::{Assistant, AssistantSettings};
use groundwork::config::{load_config, Config};
use groundwork::connector::{DocumentSelector, DocumentSource, RetryPolicy, SourceError, SourceFile};
use groundwork::db;
use groundwork::embedding::DisabledEmbedder;
use groundwork::indexer::{Indexer, IndexerSettings};
use groundwork::ocr::DisabledOcr;
use groundwork::sqlite_store::SqliteStore;
use groundwork_core::bm25;
use groundwork_core::embedding::Embedder;
use groundwork_core::llm::{CompletionRequest, LanguageModel, ModelError};
use groundwork_core::models::{Chunk, Document, IndexingState, IndexingStatus};
use groundwork_core::store::{ChunkCandidate, IndexStore, ReplaceSummary};

pub const TENANT: &str = "acme";

// ─── Document source ────────────────────────────────────────────────

/// Files held in memory. Optionally blocks `list_files` until released.
#[derive(Default)]
pub struct MemSource {
    files: Mutex<BTreeMap<String, (SourceFile, Vec<u8>)>>,
    list_error: Mutex<Option<SourceError>>,
    download_error: Mutex<Option<SourceError>>,
    gate: Option<Arc<Notify>>,
    pub downloads: AtomicUsize,
}

impl MemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn put(&self, id: &str, revision: &str, mime: &str, body: &[u8]) {
        let file = SourceFile {
            document_id: id.to_string(),
            display_name: id.to_string(),
            mime_type: mime.to_string(),
            revision_id: revision.to_string(),
            web_url: Some(format!("https://drive.google.com/file/d/{}/view", id)),
            size_bytes: Some(body.len() as u64),
        };
        self.files
            .lock()
            .unwrap()
            .insert(id.to_string(), (file, body.to_vec()));
    }

    pub fn put_text(&self, id: &str, revision: &str, body: &str) {
        self.put(id, revision, "text/plain", body.as_bytes());
    }

    /// An image no OCR engine can read: every page fails extraction.
    pub fn put_unreadable(&self, id: &str) {
        self.put(id, "r1", "image/png", b"\x89PNG not really an image");
    }

    pub fn remove(&self, id: &str) {
        self.files.lock().unwrap().remove(id);
    }

    pub fn fail_listing(&self, error: SourceError) {
        *self.list_error.lock().unwrap() = Some(error);
    }

    pub fn fail_downloads(&self, error: SourceError) {
        *self.download_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl DocumentSource for MemSource {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn list_files(&self, selector: &DocumentSelector) -> Result<Vec<SourceFile>, SourceError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(e) = self.list_error.lock().unwrap().clone() {
            return Err(e);
        }
        let files = self.files.lock().unwrap();
        Ok(files
            .values()
            .map(|(f, _)| f.clone())
            .filter(|f| match selector {
                DocumentSelector::Files(ids) => ids.contains(&f.document_id),
                _ => true,
            })
            .collect())
    }

    async fn download(&self, file: &SourceFile) -> Result<Vec<u8>, SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.download_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.files
            .lock()
            .unwrap()
            .get(&file.document_id)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| SourceError::NotFound(file.document_id.clone()))
    }
}

// ─── Language model ─────────────────────────────────────────────────

/// Replies by request kind: routing, reranking, synthesis (and repair) or
/// casual chat. Records the kind of every call.
pub struct ScriptedLlm {
    route_reply: String,
    rerank_reply: Option<String>,
    answers: Mutex<VecDeque<Result<String, ModelError>>>,
    casual_reply: String,
    calls: Mutex<Vec<&'static str>>,
}

pub const ROUTE_KNOWLEDGE: &str =
    r#"{"selections":["knowledge_base_retrieval"],"reason":"asks about documents"}"#;
pub const ROUTE_CASUAL: &str = r#"{"selections":["casual_chat"],"reason":"greeting"}"#;

impl ScriptedLlm {
    pub fn new(route_reply: &str) -> Self {
        Self {
            route_reply: route_reply.to_string(),
            rerank_reply: None,
            answers: Mutex::new(VecDeque::new()),
            casual_reply: "Hi! Ask me anything about your documents.".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn knowledge() -> Self {
        Self::new(ROUTE_KNOWLEDGE)
    }

    pub fn answering(self, answers: Vec<Result<String, ModelError>>) -> Self {
        *self.answers.lock().unwrap() = answers.into();
        self
    }

    pub fn reranking(mut self, reply: &str) -> Self {
        self.rerank_reply = Some(reply.to_string());
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.calls().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let kind = match request.schema.as_ref().map(|s| s.name.as_str()) {
            Some("route_selection") => "route",
            Some("passage_scores") => "rerank",
            Some("structured_answer") => "synthesize",
            _ => "casual",
        };
        self.calls.lock().unwrap().push(kind);
        match kind {
            "route" => Ok(self.route_reply.clone()),
            "rerank" => self
                .rerank_reply
                .clone()
                .ok_or_else(|| ModelError::Upstream("no rerank reply scripted".into())),
            "synthesize" => self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Upstream("no answer scripted".into()))),
            _ => Ok(self.casual_reply.clone()),
        }
    }
}

// ─── Embedder ───────────────────────────────────────────────────────

/// Hashed bag of words, L2-normalized.
pub struct HashEmbedder {
    pub dims: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for term in bm25::tokenize(text) {
            let h = term
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

// ─── Store wrapper ──────────────────────────────────────────────────

/// Counts searches against the wrapped store.
pub struct CountingStore {
    inner: Arc<dyn IndexStore>,
    pub searches: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn IndexStore>) -> Self {
        Self {
            inner,
            searches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IndexStore for CountingStore {
    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        self.inner.upsert(chunk).await
    }
    async fn delete(&self, tenant_id: &str, chunk_key: &str) -> Result<bool> {
        self.inner.delete(tenant_id, chunk_key).await
    }
    async fn delete_by_document(&self, tenant_id: &str, document_id: &str) -> Result<usize> {
        self.inner.delete_by_document(tenant_id, document_id).await
    }
    async fn replace_document(&self, document: &Document, chunks: &[Chunk]) -> Result<ReplaceSummary> {
        self.inner.replace_document(document, chunks).await
    }
    async fn vector_search(&self, tenant_id: &str, query_vec: &[f32], k: usize) -> Result<Vec<ChunkCandidate>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.vector_search(tenant_id, query_vec, k).await
    }
    async fn lexical_search(&self, tenant_id: &str, query_terms: &[String], k: usize) -> Result<Vec<ChunkCandidate>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.lexical_search(tenant_id, query_terms, k).await
    }
    async fn upsert_document(&self, document: &Document) -> Result<()> {
        self.inner.upsert_document(document).await
    }
    async fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>> {
        self.inner.list_documents(tenant_id).await
    }
    async fn chunk_keys(&self, tenant_id: &str, document_id: Option<&str>) -> Result<Vec<String>> {
        self.inner.chunk_keys(tenant_id, document_id).await
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<CountingStore>,
    pub embedder: Arc<dyn Embedder>,
    pub indexer: Arc<Indexer>,
}

pub struct HarnessBuilder {
    sources: Vec<(String, Arc<MemSource>)>,
    embedder: Arc<dyn Embedder>,
    extra_config: String,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            embedder: Arc::new(DisabledEmbedder),
            extra_config: String::new(),
        }
    }

    pub fn tenant(mut self, id: &str, source: Arc<MemSource>) -> Self {
        self.sources.push((id.to_string(), source));
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Extra TOML appended to the generated config.
    pub fn config(mut self, toml: &str) -> Self {
        self.extra_config.push_str(toml);
        self.extra_config.push('\n');
        self
    }

    pub async fn build(self) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut toml = format!(
            "[db]\npath = \"{}\"\n\n{}\n",
            dir.path().join("gw.sqlite").display(),
            self.extra_config
        );
        for (id, _) in &self.sources {
            toml.push_str(&format!(
                "[[tenants]]\nid = \"{}\"\nsource = \"filesystem\"\nroot = \"{}\"\n\n",
                id,
                dir.path().join(id).display()
            ));
        }
        let config_path = dir.path().join("gw.toml");
        std::fs::write(&config_path, toml).unwrap();
        let config = load_config(&config_path).unwrap();

        let pool = db::open(&config).await.unwrap();
        let sqlite: Arc<dyn IndexStore> = Arc::new(SqliteStore::new(pool.clone()));
        let store = Arc::new(CountingStore::new(sqlite));

        let mut settings = IndexerSettings::from_config(&config);
        settings.retry = RetryPolicy::immediate(2);
        let mut indexer = Indexer::new(
            pool.clone(),
            store.clone(),
            Arc::clone(&self.embedder),
            Arc::new(DisabledOcr),
            settings,
        );
        for (id, source) in self.sources {
            indexer.register(&id, source, DocumentSelector::All);
        }

        Harness {
            dir,
            config,
            pool,
            store,
            embedder: self.embedder,
            indexer: Arc::new(indexer),
        }
    }
}

impl Harness {
    pub fn assistant(&self, llm: Arc<dyn LanguageModel>) -> Assistant {
        Assistant::new(
            Arc::clone(&self.indexer),
            self.store.clone(),
            Arc::clone(&self.embedder),
            llm,
            AssistantSettings::from_config(&self.config),
        )
    }

    /// Run a rebuild of every listed document to completion.
    pub async fn index(&self, tenant: &str) -> IndexingStatus {
        self.indexer
            .rebuild(tenant, &DocumentSelector::All, groundwork::indexer::RebuildMode::Incremental)
            .await
            .unwrap()
            .expect("rebuild was rejected")
    }

    pub async fn keys(&self, tenant: &str) -> Vec<String> {
        self.store.chunk_keys(tenant, None).await.unwrap()
    }

    pub fn searches(&self) -> usize {
        self.store.searches.load(Ordering::SeqCst)
    }
}

/// Poll until the tenant leaves INDEXING.
pub async fn wait_for_job(indexer: &Indexer, tenant: &str) -> IndexingStatus {
    for _ in 0..500 {
        let status = indexer.get_status(tenant).await.unwrap();
        if status.state != IndexingState::Indexing {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("indexing job for {} did not finish", tenant);
}

/// Sentences about one topic, long enough to pass the text-density check.
pub fn policy_text(topic: &str) -> String {
    format!(
        "The {topic} policy applies to every employee. Requests for {topic} are reviewed \
         by the people team within five business days. Managers approve {topic} requests \
         and record the decision in the HR portal."
    )
}

pub fn unique<T: std::hash::Hash + Eq + Clone>(items: &[T]) -> bool {
    items.iter().cloned().collect::<HashSet<_>>().len() == items.len()
}
