//! Wiring of the long-lived components from a [`Config`].

use std::sync::Arc;

use anyhow::Result;
use groundwork_core::embedding::Embedder;
use groundwork_core::llm::LanguageModel;
use groundwork_core::store::IndexStore;

use crate::assistant::{Assistant, AssistantSettings};
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::indexer::Indexer;
use crate::llm::create_model;
use crate::ocr::build_engine;
use crate::sqlite_store::SqliteStore;

pub struct Services {
    pub store: Arc<dyn IndexStore>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LanguageModel>,
    pub indexer: Arc<Indexer>,
    pub assistant: Arc<Assistant>,
}

impl Services {
    /// Open the database (running migrations) and build every component.
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = db::open(config).await?;
        let store: Arc<dyn IndexStore> = Arc::new(SqliteStore::new(pool.clone()));
        let embedder = create_embedder(&config.embedding)?;
        let llm = create_model(&config.llm)?;
        let ocr = build_engine(&config.ocr);

        let indexer = Arc::new(Indexer::from_config(
            config,
            pool,
            Arc::clone(&store),
            Arc::clone(&embedder),
            ocr,
        ));
        let assistant = Arc::new(Assistant::new(
            Arc::clone(&indexer),
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&llm),
            AssistantSettings::from_config(config),
        ));

        tracing::debug!(
            embedder = embedder.model_name(),
            llm = llm.model_name(),
            tenants = config.tenants.len(),
            "services ready"
        );

        Ok(Self {
            store,
            embedder,
            llm,
            indexer,
            assistant,
        })
    }
}
