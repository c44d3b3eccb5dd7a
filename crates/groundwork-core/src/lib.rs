//! # Groundwork Core
//!
//! Shared, runtime-agnostic logic for Groundwork: the chunk identity model,
//! page chunking, the [`store::IndexStore`] abstraction with an in-memory
//! implementation, BM25 lexical scoring, hybrid retrieval, question routing,
//! reranking, and the structured answer contract.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. Model
//! calls are reached only through the [`embedding::Embedder`] and
//! [`llm::LanguageModel`] traits, which the application crate implements.

pub mod answer;
pub mod bm25;
pub mod catalog;
pub mod chunk;
pub mod chunk_key;
pub mod embedding;
pub mod llm;
pub mod models;
pub mod rerank;
pub mod router;
pub mod search;
pub mod store;
