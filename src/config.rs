//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. Secrets (API keys, OAuth tokens) are read from the environment,
//! never from this file.
//!
//! ```toml
//! [db]
//! path = "./data/gw.sqlite"
//!
//! [retrieval]
//! hybrid_alpha = 0.6
//!
//! [[tenants]]
//! id = "acme"
//! source = "filesystem"
//! root = "./docs/acme"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use groundwork_core::chunk::ChunkParams;
use groundwork_core::rerank::MAX_RERANK_CANDIDATES;
use groundwork_core::search::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl Config {
    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_units")]
    pub window_units: usize,
    #[serde(default = "default_overlap_units")]
    pub overlap_units: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_units: default_window_units(),
            overlap_units: default_overlap_units(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            window_units: self.window_units,
            overlap_units: self.overlap_units,
        }
    }
}

fn default_window_units() -> usize {
    500
}
fn default_overlap_units() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_overlap_boost")]
    pub overlap_boost: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_enumeration_top_k")]
    pub enumeration_top_k: usize,
    /// Fused-score cutoff in default mode. Below it, a chunk is not context.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default)]
    pub enumeration_min_relevance: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            overlap_boost: default_overlap_boost(),
            candidate_multiplier: default_candidate_multiplier(),
            top_k: default_top_k(),
            enumeration_top_k: default_enumeration_top_k(),
            min_relevance: default_min_relevance(),
            enumeration_min_relevance: 0.0,
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            hybrid_alpha: self.hybrid_alpha,
            overlap_boost: self.overlap_boost,
            candidate_multiplier: self.candidate_multiplier,
            min_relevance: self.min_relevance,
            enumeration_top_k: self.enumeration_top_k,
            enumeration_min_relevance: self.enumeration_min_relevance,
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_overlap_boost() -> f64 {
    0.1
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_top_k() -> usize {
    8
}
fn default_enumeration_top_k() -> usize {
    30
}
fn default_min_relevance() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Candidates sent to the reranker. Capped at 50.
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_llm_model(),
            url: default_llm_url(),
            timeout_secs: default_llm_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            rerank_top_n: default_rerank_top_n(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_rerank_top_n() -> usize {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// `disabled` or `tesseract`.
    #[serde(default = "default_provider")]
    pub engine: String,
    #[serde(default = "default_tesseract_command")]
    pub command: String,
    /// Renders PDF pages to images for OCR.
    #[serde(default = "default_rasterizer_command")]
    pub rasterizer_command: String,
    #[serde(default = "default_ocr_langs")]
    pub langs: String,
    #[serde(default = "default_ocr_dpi")]
    pub dpi: u32,
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    /// Pages with fewer non-whitespace characters go to OCR.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine: default_provider(),
            command: default_tesseract_command(),
            rasterizer_command: default_rasterizer_command(),
            langs: default_ocr_langs(),
            dpi: default_ocr_dpi(),
            page_timeout_secs: default_page_timeout_secs(),
            min_text_chars: default_min_text_chars(),
        }
    }
}

impl OcrConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}

fn default_tesseract_command() -> String {
    "tesseract".to_string()
}
fn default_rasterizer_command() -> String {
    "pdftoppm".to_string()
}
fn default_ocr_langs() -> String {
    "eng".to_string()
}
fn default_ocr_dpi() -> u32 {
    300
}
fn default_page_timeout_secs() -> u64 {
    20
}
fn default_min_text_chars() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Total attempts for a transient fetch failure, including the first.
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            download_attempts: default_download_attempts(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_file_bytes: default_max_file_bytes(),
            timeout_secs: default_source_timeout_secs(),
        }
    }
}

fn default_download_attempts() -> u32 {
    4
}
fn default_backoff_cap_secs() -> u64 {
    8
}
fn default_max_file_bytes() -> u64 {
    50_000_000
}
fn default_source_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// A lease not renewed within this window is considered abandoned.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// When true, any failed document makes the whole run FAILED.
    #[serde(default)]
    pub require_all_documents: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            require_all_documents: false,
        }
    }
}

fn default_lease_ttl_secs() -> u64 {
    600
}
fn default_heartbeat_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TenantConfig {
    pub id: String,
    #[serde(flatten)]
    pub source: TenantSource,
}

/// Where a tenant's documents come from.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TenantSource {
    Filesystem {
        root: PathBuf,
        #[serde(default = "default_include_globs")]
        include_globs: Vec<String>,
        #[serde(default)]
        exclude_globs: Vec<String>,
    },
    Drive {
        #[serde(default)]
        folder_id: Option<String>,
        #[serde(default)]
        file_ids: Vec<String>,
        /// Environment variable holding the OAuth access token.
        #[serde(default = "default_token_env")]
        token_env: String,
    },
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.pdf", "**/*.docx", "**/*.pptx", "**/*.xlsx", "**/*.md", "**/*.txt", "**/*.csv",
        "**/*.png", "**/*.jpg", "**/*.jpeg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_token_env() -> String {
    "GOOGLE_DRIVE_TOKEN".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.window_units == 0 {
        bail!("chunking.window_units must be > 0");
    }
    if config.chunking.overlap_units >= config.chunking.window_units {
        bail!("chunking.overlap_units must be smaller than chunking.window_units");
    }

    let r = &config.retrieval;
    if !(0.0..=1.0).contains(&r.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if r.top_k == 0 || r.candidate_multiplier == 0 {
        bail!("retrieval.top_k and retrieval.candidate_multiplier must be >= 1");
    }
    if r.overlap_boost < 0.0 || r.min_relevance < 0.0 || r.enumeration_min_relevance < 0.0 {
        bail!("retrieval boosts and relevance cutoffs must be >= 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!("Unknown llm provider: '{}'. Must be disabled or openai.", other),
    }
    if config.llm.rerank_top_n > MAX_RERANK_CANDIDATES {
        bail!("llm.rerank_top_n must be <= {}", MAX_RERANK_CANDIDATES);
    }
    if config.llm.max_in_flight == 0 || config.embedding.max_in_flight == 0 {
        bail!("max_in_flight must be >= 1");
    }

    match config.ocr.engine.as_str() {
        "disabled" | "tesseract" => {}
        other => bail!("Unknown ocr engine: '{}'. Must be disabled or tesseract.", other),
    }

    if config.source.download_attempts == 0 {
        bail!("source.download_attempts must be >= 1");
    }
    if config.indexing.heartbeat_secs == 0
        || config.indexing.heartbeat_secs >= config.indexing.lease_ttl_secs
    {
        bail!("indexing.heartbeat_secs must be > 0 and smaller than indexing.lease_ttl_secs");
    }
    if config.scheduler.enabled && config.scheduler.interval_secs == 0 {
        bail!("scheduler.interval_secs must be > 0");
    }

    let mut seen = std::collections::HashSet::new();
    for t in &config.tenants {
        if t.id.trim().is_empty() {
            bail!("tenant id must not be empty");
        }
        if !seen.insert(t.id.as_str()) {
            bail!("duplicate tenant id: {}", t.id);
        }
    }

    Ok(())
}
