//! Per-query state machine.
//!
//! ```text
//! ROUTING ─┬─▶ CASUAL_ANSWER
//!          └─▶ RETRIEVING ─▶ RERANKING ─▶ SYNTHESIZING ─┬─▶ ANSWERED
//!                                                       ├─▶ CATALOG_FALLBACK
//!                                                       └─▶ REFUSED
//! ```
//!
//! [`Assistant::answer_question`] first checks the tenant's indexing status
//! and returns [`QueryOutcome::NotReady`] unless it is READY. Past that gate
//! every path ends in a [`StructuredAnswer`]; model failures, timeouts and
//! malformed replies become refusals, never errors.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use groundwork_core::answer::{
    answer_schema, extract_json, parse_structured_answer, ParsedAnswer, RefusalReason,
    StructuredAnswer,
};
use groundwork_core::catalog::{
    build_catalog, catalog_answer, is_catalog_query, is_enumeration_query, needs_catalog_fallback,
    parse_list_limit, CatalogEntry,
};
use groundwork_core::embedding::{embed_query, Embedder};
use groundwork_core::llm::{CompletionRequest, LanguageModel};
use groundwork_core::models::{IndexingState, RetrievalCandidate};
use groundwork_core::rerank::rerank;
use groundwork_core::router::{classify, Route};
use groundwork_core::search::{retrieve, RetrievalMode, RetrievalParams, RetrieveRequest};
use groundwork_core::store::IndexStore;

use crate::config::Config;
use crate::indexer::Indexer;

/// Terms that must never appear in a question or an answer.
const FORBIDDEN_TERMS: [&str; 2] = ["internal-confidential", "secret-key"];

const UNSAFE_QUESTION_TEXT: &str = "I can't help with that request.";
const UNSAFE_ANSWER_TEXT: &str = "[REDACTED due to safety policy]";
const NOT_IN_DOCS_TEXT: &str = "Insufficient information in your documents to answer that.";

const CASUAL_SYSTEM: &str = "You are a friendly assistant. Respond briefly and naturally to casual \
conversation. If the user asks about internal documents or data, say you can look it up and ask \
for a specific question.";

const SYNTHESIS_SYSTEM: &str = "You answer questions about the user's documents. \
Answer based ONLY on the numbered context passages. \
Cite every document you use by its file_id and file_name, with short verbatim snippets. \
If the context does not contain the answer, set refused to true, refusal_reason to \
\"not_in_docs\", answer to \"Insufficient information\" and citations to []. \
Use answer_style \"bullets\" for lists, \"sections\" for multi-part answers, otherwise \"paragraph\". \
Reply with a single JSON object matching the schema.";

const ENUMERATION_GUIDANCE: &str = "The user asked for a list. Enumerate every unique item \
mentioned in the context as markdown bullets; do not stop early. If the context seems \
incomplete, add: '(List may be incomplete)'.";

/// States a query moves through; logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Routing,
    CasualAnswer,
    Retrieving,
    Reranking,
    Synthesizing,
    Answered,
    CatalogFallback,
    Refused,
}

/// Result of [`Assistant::answer_question`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered(StructuredAnswer),
    /// The tenant's index is not READY; nothing was retrieved.
    NotReady {
        status: IndexingState,
        progress: u8,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct AssistantSettings {
    pub retrieval: RetrievalParams,
    pub top_k: usize,
    pub rerank_top_n: usize,
}

impl AssistantSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retrieval: config.retrieval.params(),
            top_k: config.retrieval.top_k,
            rerank_top_n: config.llm.rerank_top_n,
        }
    }
}

pub struct Assistant {
    indexer: Arc<Indexer>,
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    settings: AssistantSettings,
}

impl Assistant {
    pub fn new(
        indexer: Arc<Indexer>,
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        settings: AssistantSettings,
    ) -> Self {
        Self {
            indexer,
            store,
            embedder,
            llm,
            settings,
        }
    }

    /// Answer `question` from `tenant_id`'s documents.
    ///
    /// Errors only when the tenant's status cannot be read.
    pub async fn answer_question(&self, tenant_id: &str, question: &str) -> Result<QueryOutcome> {
        let status = self.indexer.get_status(tenant_id).await?;
        if !status.is_ready() {
            tracing::info!(tenant = %tenant_id, state = status.state.as_str(), "query rejected, index not ready");
            return Ok(QueryOutcome::NotReady {
                status: status.state,
                progress: status.progress,
                message: status.message,
            });
        }

        if contains_forbidden(question) {
            enter(tenant_id, QueryState::Refused);
            return Ok(QueryOutcome::Answered(StructuredAnswer::refused(
                RefusalReason::Unsafe,
                UNSAFE_QUESTION_TEXT,
            )));
        }

        let answer = self.run(tenant_id, question).await;

        if contains_forbidden(&answer.answer) {
            tracing::warn!(tenant = %tenant_id, "answer withheld by safety policy");
            return Ok(QueryOutcome::Answered(StructuredAnswer::refused(
                RefusalReason::Unsafe,
                UNSAFE_ANSWER_TEXT,
            )));
        }
        Ok(QueryOutcome::Answered(answer))
    }

    async fn run(&self, tenant_id: &str, question: &str) -> StructuredAnswer {
        enter(tenant_id, QueryState::Routing);
        let decision = classify(self.llm.as_ref(), question).await;
        tracing::info!(tenant = %tenant_id, route = ?decision.route, reason = %decision.reason, "routed");

        match decision.route {
            Route::Casual => {
                enter(tenant_id, QueryState::CasualAnswer);
                self.casual(question).await
            }
            Route::Knowledge => self.knowledge(tenant_id, question).await,
        }
    }

    async fn casual(&self, question: &str) -> StructuredAnswer {
        let request = CompletionRequest::new(CASUAL_SYSTEM, format!("User: {}\nAssistant:", question));
        match self.llm.complete(&request).await {
            Ok(raw) => casual_text(&raw),
            Err(e) => {
                tracing::warn!(error = %e, "casual reply failed");
                StructuredAnswer::fallback()
            }
        }
    }

    async fn knowledge(&self, tenant_id: &str, question: &str) -> StructuredAnswer {
        let enumeration = is_enumeration_query(question);
        let mode = if enumeration {
            RetrievalMode::Enumeration
        } else {
            RetrievalMode::Default
        };

        enter(tenant_id, QueryState::Retrieving);
        let query_vec = self.query_vector(question).await;
        let request = RetrieveRequest {
            tenant_id,
            query: question,
            query_vec: query_vec.as_deref(),
            top_k: self.settings.top_k,
            mode,
            params: &self.settings.retrieval,
        };
        let candidates = match retrieve(self.store.as_ref(), &request).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(tenant = %tenant_id, error = %e, "retrieval failed");
                return refuse(tenant_id, StructuredAnswer::fallback());
            }
        };
        tracing::debug!(tenant = %tenant_id, candidates = candidates.len(), ?mode, "retrieved");

        if candidates.is_empty() {
            return self.without_context(tenant_id, question, enumeration).await;
        }

        enter(tenant_id, QueryState::Reranking);
        let reranked = rerank(
            self.llm.as_ref(),
            question,
            candidates,
            self.settings.rerank_top_n,
        )
        .await;
        if reranked.is_empty() {
            return self.without_context(tenant_id, question, enumeration).await;
        }

        enter(tenant_id, QueryState::Synthesizing);
        let answer = match self.synthesize(question, &reranked, enumeration).await {
            Some(answer) => answer,
            None => return refuse(tenant_id, StructuredAnswer::fallback()),
        };

        if enumeration {
            let catalog = self.catalog(tenant_id).await;
            if needs_catalog_fallback(question, &answer, catalog.len()) {
                enter(tenant_id, QueryState::CatalogFallback);
                return catalog_answer(&catalog, parse_list_limit(question));
            }
        }

        if answer.refused {
            return refuse(tenant_id, answer);
        }
        enter(tenant_id, QueryState::Answered);
        answer
    }

    /// Nothing relevant was retrieved. Only a list request about the
    /// collection itself is answered from the catalog.
    async fn without_context(
        &self,
        tenant_id: &str,
        question: &str,
        enumeration: bool,
    ) -> StructuredAnswer {
        if enumeration && is_catalog_query(question) {
            enter(tenant_id, QueryState::CatalogFallback);
            let catalog = self.catalog(tenant_id).await;
            return catalog_answer(&catalog, parse_list_limit(question));
        }
        refuse(
            tenant_id,
            StructuredAnswer::refused(RefusalReason::NotInDocs, NOT_IN_DOCS_TEXT),
        )
    }

    async fn query_vector(&self, question: &str) -> Option<Vec<f32>> {
        if self.embedder.dims() == 0 {
            return None;
        }
        match embed_query(self.embedder.as_ref(), question).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, using lexical search only");
                None
            }
        }
    }

    async fn catalog(&self, tenant_id: &str) -> Vec<CatalogEntry> {
        match self.store.list_documents(tenant_id).await {
            Ok(docs) => build_catalog(&docs),
            Err(e) => {
                tracing::warn!(tenant = %tenant_id, error = %e, "could not load document catalog");
                Vec::new()
            }
        }
    }

    /// One synthesis call plus at most one repair call. `None` when no valid
    /// answer could be obtained.
    async fn synthesize(
        &self,
        question: &str,
        context: &[RetrievalCandidate],
        enumeration: bool,
    ) -> Option<StructuredAnswer> {
        let request = synthesis_request(question, context, enumeration);
        let raw = match self.llm.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "synthesis call failed");
                return None;
            }
        };

        let parsed = match parse_structured_answer(&raw) {
            ParsedAnswer::Valid(answer) => answer,
            ParsedAnswer::Malformed { raw, error } => {
                tracing::warn!(error = %error, "malformed synthesis reply, asking for a repair");
                let repair = repair_request(&request, &raw, &error);
                let repaired = match self.llm.complete(&repair).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "repair call failed");
                        return None;
                    }
                };
                match parse_structured_answer(&repaired) {
                    ParsedAnswer::Valid(answer) => answer,
                    ParsedAnswer::Malformed { error, .. } => {
                        tracing::warn!(error = %error, "repair reply still malformed");
                        return None;
                    }
                }
            }
        };

        Some(ground_citations(parsed, context))
    }
}

fn enter(tenant_id: &str, state: QueryState) {
    tracing::debug!(tenant = %tenant_id, ?state, "query state");
}

fn refuse(tenant_id: &str, answer: StructuredAnswer) -> StructuredAnswer {
    enter(tenant_id, QueryState::Refused);
    tracing::info!(tenant = %tenant_id, reason = ?answer.refusal_reason, "query refused");
    answer
}

fn contains_forbidden(text: &str) -> bool {
    let lower = text.to_lowercase();
    FORBIDDEN_TERMS.iter().any(|t| lower.contains(t))
}

/// Casual replies may come back as JSON or plain text.
fn casual_text(raw: &str) -> StructuredAnswer {
    let text = match parse_structured_answer(raw) {
        ParsedAnswer::Valid(a) if !a.answer.trim().is_empty() => a.answer,
        _ => extract_json(raw)
            .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
            .and_then(|v| v.get("answer").and_then(|a| a.as_str()).map(str::to_string))
            .unwrap_or_else(|| raw.trim().to_string()),
    };
    if text.trim().is_empty() {
        return StructuredAnswer::fallback();
    }
    StructuredAnswer::casual(text)
}

/// Numbered context block shown to the model.
pub fn format_context(context: &[RetrievalCandidate]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "[{}] file_id: {} | file_name: {} | page {}\n{}",
                i + 1,
                c.document_id,
                c.source_document_name,
                c.page_number,
                c.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn synthesis_request(
    question: &str,
    context: &[RetrievalCandidate],
    enumeration: bool,
) -> CompletionRequest {
    let guidance = if enumeration { ENUMERATION_GUIDANCE } else { "" };
    let prompt = format!(
        "Context:\n{}\n\n{}\nQuestion: {}",
        format_context(context),
        guidance,
        question
    );
    CompletionRequest::new(SYNTHESIS_SYSTEM, prompt).with_schema("structured_answer", answer_schema())
}

fn repair_request(original: &CompletionRequest, raw: &str, error: &str) -> CompletionRequest {
    let prompt = format!(
        "{}\n\nYour previous reply was not valid ({}):\n{}\n\nReply again with only the JSON object.",
        original.prompt, error, raw
    );
    let mut request = CompletionRequest::new(original.system.clone(), prompt);
    request.schema = original.schema.clone();
    request
}

/// Drop citations of documents that were not in the context.
fn ground_citations(mut answer: StructuredAnswer, context: &[RetrievalCandidate]) -> StructuredAnswer {
    let known: HashSet<&str> = context.iter().map(|c| c.document_id.as_str()).collect();
    let before = answer.citations.len();
    answer.citations.retain(|c| known.contains(c.file_id.as_str()));
    if answer.citations.len() < before {
        tracing::warn!(
            dropped = before - answer.citations.len(),
            "answer cited documents outside the retrieved context"
        );
    }
    if answer.refused {
        answer.citations.clear();
    }
    answer
}
