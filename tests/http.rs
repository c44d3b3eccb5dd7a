//! HTTP surface, served on an ephemeral port.

mod common;

use std::sync::Arc;

use common::*;
use groundwork::server::router;
use groundwork::indexer::MSG_CANCELLED;
use groundwork_core::models::IndexingState;
use serde_json::{json, Value};
use tokio::sync::Notify;

async fn serve(h: &Harness, llm: Arc<ScriptedLlm>) -> String {
    let app = router(Arc::clone(&h.indexer), Arc::new(h.assistant(llm)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_reports_version() {
    let h = HarnessBuilder::new().build().await;
    let base = serve(&h, Arc::new(ScriptedLlm::knowledge())).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn ask_before_indexing_is_a_not_ready_conflict() {
    let h = HarnessBuilder::new()
        .tenant(TENANT, Arc::new(MemSource::new()))
        .build()
        .await;
    let base = serve(&h, Arc::new(ScriptedLlm::knowledge())).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/tenants/{}/ask", base, TENANT))
        .json(&json!({ "question": "What is the leave policy?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_ready");
    assert_eq!(body["error"]["state"], "PENDING");
    assert_eq!(body["error"]["progress"], 0);
}

#[tokio::test]
async fn rebuild_then_ask() {
    let source = Arc::new(MemSource::new());
    source.put_text("leave.txt", "r1", &policy_text("annual leave"));
    let h = HarnessBuilder::new().tenant(TENANT, source).build().await;
    let llm = Arc::new(ScriptedLlm::knowledge().answering(vec![Ok(json!({
        "answer": "Five business days.",
        "refused": false,
        "refusal_reason": "unknown",
        "answer_style": "paragraph",
        "entities": [],
        "citations": [{ "file_id": "leave.txt", "file_name": "leave.txt", "snippets": ["five business days"] }]
    })
    .to_string())]));
    let base = serve(&h, llm).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tenants/{}/rebuild", base, TENANT))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "accepted");
    assert!(body["job_id"].is_string());

    assert_eq!(wait_for_job(&h.indexer, TENANT).await.state, IndexingState::Ready);

    let status: Value = client
        .get(format!("{}/tenants/{}/status", base, TENANT))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "READY");
    assert_eq!(status["progress"], 100);
    assert_eq!(status["document_count"], 1);

    let resp = client
        .post(format!("{}/tenants/{}/ask", base, TENANT))
        .json(&json!({ "question": "How long do annual leave requests take?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let answer: Value = resp.json().await.unwrap();
    assert_eq!(answer["refused"], false);
    assert_eq!(answer["citations"][0]["file_id"], "leave.txt");
    let mut keys: Vec<&str> = answer.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["answer", "answer_style", "citations", "entities", "refusal_reason", "refused"]
    );
}

#[tokio::test]
async fn unknown_tenant_and_empty_question() {
    let h = HarnessBuilder::new()
        .tenant(TENANT, Arc::new(MemSource::new()))
        .build()
        .await;
    let base = serve(&h, Arc::new(ScriptedLlm::knowledge())).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/tenants/nobody/status", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/tenants/{}/ask", base, TENANT))
        .json(&json!({ "question": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn cancel_stops_a_running_rebuild() {
    let gate = Arc::new(Notify::new());
    let source = Arc::new(MemSource::gated(gate.clone()));
    source.put_text("leave.txt", "r1", &policy_text("annual leave"));
    let h = HarnessBuilder::new().tenant(TENANT, source).build().await;
    let base = serve(&h, Arc::new(ScriptedLlm::knowledge())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tenants/{}/cancel", base, TENANT))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "not_running");

    let resp = client
        .post(format!("{}/tenants/{}/rebuild", base, TENANT))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let resp = client
        .post(format!("{}/tenants/{}/cancel", base, TENANT))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "cancelled");

    let status: Value = client
        .get(format!("{}/tenants/{}/status", base, TENANT))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "FAILED");
    assert_eq!(status["message"], MSG_CANCELLED);

    let resp = client
        .post(format!("{}/tenants/nobody/cancel", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    gate.notify_one();
}
