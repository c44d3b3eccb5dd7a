//! # groundwork
//!
//! Multi-tenant, retrieval-augmented question answering over document
//! folders. Each tenant's documents are pulled from a source (a local folder
//! or a Google Drive selection), normalized page by page (digital text, with
//! OCR for scanned pages), chunked, embedded and written into a shared,
//! tenant-scoped index. Questions are routed, answered from hybrid retrieval
//! plus LLM reranking, and always come back as a [`StructuredAnswer`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Sources    │──▶│   Adapter    │──▶│ Chunk+Embed  │──▶│  SQLite  │
//! │  FS / Drive  │   │ text + OCR   │   │  500 / 60    │   │  index   │
//! └──────────────┘   └──────────────┘   └──────────────┘   └────┬─────┘
//!        ▲ indexer (lease per tenant) ◀── scheduler / rebuild    │
//!                                                                ▼
//!                 router ─▶ hybrid retrieve ─▶ rerank ─▶ synthesize
//!                                                                │
//!                           ┌──────────┐   ┌──────────┐          │
//!                           │   CLI    │   │   HTTP   │ ◀────────┘
//!                           │   (gw)   │   │  (axum)  │
//!                           └──────────┘   └──────────┘
//! ```
//!
//! Models and pure algorithms (chunk identity, chunking, BM25, fusion,
//! routing, answer parsing, catalog fallback) live in `groundwork-core`.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`], [`migrate`] | SQLite pool and schema |
//! | [`sqlite_store`] | Tenant-scoped index store |
//! | [`ledger`] | Indexing status and per-tenant leases |
//! | [`connector`], [`connector_fs`], [`connector_drive`] | Document sources |
//! | [`extract`], [`ocr`], [`adapter`] | Page-level normalization |
//! | [`embedding`], [`llm`] | Model providers with timeouts and retry |
//! | [`indexer`], [`scheduler`] | Indexing job and periodic rebuilds |
//! | [`assistant`] | Per-query state machine |
//! | [`server`] | HTTP surface |
//!
//! [`StructuredAnswer`]: groundwork_core::answer::StructuredAnswer

pub mod adapter;
pub mod assistant;
pub mod config;
pub mod connector;
pub mod connector_drive;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod indexer;
pub mod ledger;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod ocr;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod sqlite_store;
