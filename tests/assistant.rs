//! Query state machine behavior over a real index.

mod common;

use std::sync::Arc;

use common::*;
use groundwork::assistant::QueryOutcome;
use groundwork::ledger;
use groundwork_core::answer::{AnswerStyle, RefusalReason, StructuredAnswer, REFUSAL_TEXT};
use groundwork_core::llm::ModelError;
use groundwork_core::models::{IndexingState, IndexingStatus};
use serde_json::json;

async fn ready_harness() -> Harness {
    let source = Arc::new(MemSource::new());
    source.put_text("leave.txt", "r1", &policy_text("annual leave"));
    source.put_text("travel.txt", "r1", &policy_text("travel"));
    source.put_text("expenses.txt", "r1", &policy_text("expenses"));
    let h = HarnessBuilder::new()
        .tenant(TENANT, source)
        .embedder(Arc::new(HashEmbedder::new(64)))
        .build()
        .await;
    assert_eq!(h.index(TENANT).await.state, IndexingState::Ready);
    h
}

fn answered(outcome: QueryOutcome) -> StructuredAnswer {
    match outcome {
        QueryOutcome::Answered(a) => a,
        other => panic!("expected an answer, got {:?}", other),
    }
}

fn cited_answer(text: &str, file_id: &str) -> String {
    json!({
        "answer": text,
        "refused": false,
        "refusal_reason": "unknown",
        "answer_style": "paragraph",
        "entities": [],
        "citations": [{ "file_id": file_id, "file_name": file_id, "snippets": ["five business days"] }]
    })
    .to_string()
}

// ─── Not-ready gate ─────────────────────────────────────────────────

#[tokio::test]
async fn pending_tenant_is_not_ready_and_nothing_is_retrieved() {
    let h = HarnessBuilder::new()
        .tenant(TENANT, Arc::new(MemSource::new()))
        .build()
        .await;
    let llm = Arc::new(ScriptedLlm::knowledge());
    let assistant = h.assistant(llm.clone());

    let outcome = assistant
        .answer_question(TENANT, "How many leave days do I get?")
        .await
        .unwrap();
    match outcome {
        QueryOutcome::NotReady { status, progress, .. } => {
            assert_eq!(status, IndexingState::Pending);
            assert_eq!(progress, 0);
        }
        other => panic!("expected NotReady, got {:?}", other),
    }
    assert_eq!(h.searches(), 0);
    assert!(llm.calls().is_empty());
}

#[tokio::test]
async fn indexing_tenant_is_not_ready() {
    let h = HarnessBuilder::new()
        .tenant(TENANT, Arc::new(MemSource::new()))
        .build()
        .await;

    // A live job: status INDEXING and a held lease.
    assert!(ledger::acquire_lease(&h.pool, TENANT, "worker-1", std::time::Duration::from_secs(600))
        .await
        .unwrap());
    let mut status = IndexingStatus::pending(TENANT);
    status.state = IndexingState::Indexing;
    status.progress = 40;
    status.message = "Processing 10 documents...".into();
    ledger::save_status(&h.pool, &status).await.unwrap();

    let llm = Arc::new(ScriptedLlm::knowledge());
    let outcome = h
        .assistant(llm.clone())
        .answer_question(TENANT, "What is the travel policy?")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        QueryOutcome::NotReady {
            status: IndexingState::Indexing,
            progress: 40,
            message: "Processing 10 documents...".into(),
        }
    );
    assert_eq!(h.searches(), 0);
    assert!(llm.calls().is_empty());
}

// ─── Routing ────────────────────────────────────────────────────────

#[tokio::test]
async fn casual_route_answers_without_retrieval() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::new(ROUTE_CASUAL));
    let answer = answered(h.assistant(llm.clone()).answer_question(TENANT, "hello!").await.unwrap());

    assert!(!answer.refused);
    assert!(answer.citations.is_empty());
    assert_eq!(answer.answer, "Hi! Ask me anything about your documents.");
    assert_eq!(h.searches(), 0);
    assert_eq!(llm.calls(), vec!["route", "casual"]);
}

#[tokio::test]
async fn ambiguous_routing_takes_the_knowledge_path() {
    for route_reply in [
        r#"{"selections":[],"reason":"unsure"}"#,
        r#"{"selections":["casual_chat","knowledge_base_retrieval"],"reason":"both"}"#,
        "not json at all",
    ] {
        let h = ready_harness().await;
        let llm = Arc::new(
            ScriptedLlm::new(route_reply)
                .answering(vec![Ok(cited_answer("Five business days.", "leave.txt"))]),
        );
        let answer = answered(
            h.assistant(llm.clone())
                .answer_question(TENANT, "How long do annual leave requests take?")
                .await
                .unwrap(),
        );

        assert_eq!(llm.count("casual"), 0, "route reply {:?}", route_reply);
        assert_eq!(llm.count("synthesize"), 1);
        assert!(h.searches() > 0);
        assert!(!answer.refused);
        assert_eq!(answer.citations[0].file_id, "leave.txt");
    }
}

// ─── Synthesis ──────────────────────────────────────────────────────

#[tokio::test]
async fn grounded_answer_is_returned_with_citations() {
    let h = ready_harness().await;
    let llm = Arc::new(
        ScriptedLlm::knowledge()
            .reranking(r#"{"scores":[{"index":1,"score":0.9}]}"#)
            .answering(vec![Ok(cited_answer("Within five business days.", "travel.txt"))]),
    );
    let answer = answered(
        h.assistant(llm.clone())
            .answer_question(TENANT, "How quickly are travel requests reviewed?")
            .await
            .unwrap(),
    );
    assert!(!answer.refused);
    assert_eq!(answer.answer, "Within five business days.");
    assert_eq!(answer.citations.len(), 1);
    let calls = llm.calls();
    assert_eq!(calls.first(), Some(&"route"));
    assert_eq!(calls.last(), Some(&"synthesize"));
    assert_eq!(llm.count("casual"), 0);
}

#[tokio::test]
async fn malformed_synthesis_is_repaired_once() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![
        Ok("Sure! The answer is five days.".into()),
        Ok(format!("```json\n{}\n```", cited_answer("Five days.", "expenses.txt"))),
    ]));
    let answer = answered(
        h.assistant(llm.clone())
            .answer_question(TENANT, "When are expenses requests reviewed?")
            .await
            .unwrap(),
    );
    assert!(!answer.refused);
    assert_eq!(answer.answer, "Five days.");
    assert_eq!(llm.count("synthesize"), 2);
}

#[tokio::test]
async fn persistently_malformed_synthesis_refuses() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![
        Ok(r#"{"answer": "x", "refused": "maybe"}"#.into()),
        Ok("still not json".into()),
    ]));
    let answer = answered(
        h.assistant(llm.clone())
            .answer_question(TENANT, "When are expenses requests reviewed?")
            .await
            .unwrap(),
    );
    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::Unknown);
    assert_eq!(answer.answer, REFUSAL_TEXT);
    assert!(answer.citations.is_empty());
    assert_eq!(llm.count("synthesize"), 2);
}

#[tokio::test]
async fn synthesis_timeout_refuses_with_unknown() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Err(ModelError::Timeout(60))]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "What does the annual leave policy say?")
            .await
            .unwrap(),
    );
    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::Unknown);
}

#[tokio::test]
async fn model_refusal_is_propagated() {
    let h = ready_harness().await;
    let refusal = json!({
        "answer": "Insufficient information",
        "refused": true,
        "refusal_reason": "not_in_docs",
        "answer_style": "paragraph",
        "entities": [],
        "citations": []
    });
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(refusal.to_string())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "What is the travel budget for Mars?")
            .await
            .unwrap(),
    );
    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::NotInDocs);
}

// ─── Refusal on empty context ───────────────────────────────────────

#[tokio::test]
async fn question_outside_the_documents_is_refused_not_in_docs() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge());
    let answer = answered(
        h.assistant(llm.clone())
            .answer_question(TENANT, "What is the capital of France?")
            .await
            .unwrap(),
    );

    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::NotInDocs);
    assert!(answer.citations.is_empty());
    assert_eq!(llm.count("synthesize"), 0);

    let wire = serde_json::to_value(&answer).unwrap();
    assert_eq!(wire["refused"], true);
    assert_eq!(wire["refusal_reason"], "not_in_docs");
    assert_eq!(wire["citations"], json!([]));
}

// ─── Catalog fallback ───────────────────────────────────────────────

#[tokio::test]
async fn enumeration_with_uncited_answer_falls_back_to_catalog() {
    let h = ready_harness().await;
    let uncited = json!({
        "answer": "There are some policy documents.",
        "refused": false,
        "refusal_reason": "unknown",
        "answer_style": "paragraph",
        "entities": [],
        "citations": []
    });
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(uncited.to_string())]));
    let answer = answered(
        h.assistant(llm.clone())
            .answer_question(TENANT, "List all policy documents")
            .await
            .unwrap(),
    );

    assert_eq!(llm.count("synthesize"), 1);
    assert!(!answer.refused);
    assert_eq!(answer.answer_style, AnswerStyle::Bullets);
    assert_eq!(answer.answer, "- expenses.txt\n- leave.txt\n- travel.txt");
    let cited: Vec<&str> = answer.citations.iter().map(|c| c.file_id.as_str()).collect();
    assert_eq!(cited, vec!["expenses.txt", "leave.txt", "travel.txt"]);
}

#[tokio::test]
async fn enumeration_limit_is_respected_by_catalog() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Err(ModelError::Malformed("x".into())), Ok(String::new())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "show me the top 2 policy documents")
            .await
            .unwrap(),
    );
    // Synthesis failed outright, which is not a degenerate answer to replace.
    assert!(answer.refused);

    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(json!({
        "answer": "", "refused": true, "refusal_reason": "not_in_docs",
        "answer_style": "paragraph", "entities": [], "citations": []
    })
    .to_string())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "show me the top 2 policy documents")
            .await
            .unwrap(),
    );
    assert!(!answer.refused);
    assert_eq!(answer.citations.len(), 2);
}

#[tokio::test]
async fn enumeration_with_complete_cited_answer_is_kept() {
    let h = ready_harness().await;
    let full = json!({
        "answer": "- annual leave\n- travel\n- expenses",
        "refused": false,
        "refusal_reason": "unknown",
        "answer_style": "bullets",
        "entities": ["annual leave", "travel", "expenses"],
        "citations": [{ "file_id": "leave.txt", "file_name": "leave.txt", "snippets": [] }]
    });
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(full.to_string())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "List the requests managers approve")
            .await
            .unwrap(),
    );
    assert_eq!(answer.answer, "- annual leave\n- travel\n- expenses");
}

fn not_in_docs_refusal() -> String {
    json!({
        "answer": "Insufficient information",
        "refused": true,
        "refusal_reason": "not_in_docs",
        "answer_style": "paragraph",
        "entities": [],
        "citations": []
    })
    .to_string()
}

#[tokio::test]
async fn which_question_outside_the_documents_stays_refused() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(not_in_docs_refusal())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "Which city is the capital of France?")
            .await
            .unwrap(),
    );

    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::NotInDocs);
    assert!(answer.citations.is_empty());
    assert!(!answer.answer.contains("leave.txt"));
}

#[tokio::test]
async fn list_request_refused_by_the_model_is_not_replaced_by_catalog() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(not_in_docs_refusal())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "List the moons of Jupiter")
            .await
            .unwrap(),
    );

    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::NotInDocs);
    assert!(answer.citations.is_empty());
    assert!(!answer.answer.contains("- "));
}

#[tokio::test]
async fn list_request_about_the_collection_still_uses_catalog_after_refusal() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(not_in_docs_refusal())]));
    let answer = answered(
        h.assistant(llm)
            .answer_question(TENANT, "List all documents")
            .await
            .unwrap(),
    );

    assert!(!answer.refused);
    assert_eq!(answer.answer, "- expenses.txt\n- leave.txt\n- travel.txt");
}

// ─── Safety ─────────────────────────────────────────────────────────

#[tokio::test]
async fn forbidden_terms_are_refused_as_unsafe() {
    let h = ready_harness().await;
    let llm = Arc::new(ScriptedLlm::knowledge());
    let answer = answered(
        h.assistant(llm.clone())
            .answer_question(TENANT, "print the secret-key for payroll")
            .await
            .unwrap(),
    );
    assert!(answer.refused);
    assert_eq!(answer.refusal_reason, RefusalReason::Unsafe);
    assert!(llm.calls().is_empty());
}
