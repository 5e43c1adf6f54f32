// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end coordinator tests over a real HTTP listener: enrollment,
//! signed pull/result, settlement, replay protection and the handshake flow.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use edgecoder_config::Config;
use edgecoder_crypto::{
    now_ms, sign_request, NodeIdentity, TrustedKeys, HDR_AGENT_ID, HDR_BODY_SHA256, HDR_NONCE,
    HDR_SIGNATURE, HDR_TIMESTAMP_MS,
};
use edgecoder_model::MockProvider;
use edgecoder_node::{http::router, AppState};

struct TestNode {
    state: AppState,
    base: String,
}

async fn start_node() -> TestNode {
    let mut config = Config::default();
    config.node.registration_token = Some("enroll-tok".into());
    config.sandbox.mode = "none".into();
    let config = Arc::new(config);

    let identity = NodeIdentity::generate_with_id("edge-coordinator");
    let state = AppState::build(config, identity, TrustedKeys::new(), Arc::new(MockProvider))
        .expect("state builds");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestNode {
        state,
        base: format!("http://{addr}"),
    }
}

fn signed(
    client: &reqwest::Client,
    identity: &NodeIdentity,
    base: &str,
    path: &str,
    body: &serde_json::Value,
    nonce: &str,
) -> reqwest::RequestBuilder {
    let bytes = serde_json::to_vec(body).unwrap();
    let headers = sign_request(identity, "POST", path, &bytes, now_ms(), nonce);
    client
        .post(format!("{base}{path}"))
        .header(HDR_AGENT_ID, headers.peer_id)
        .header(HDR_TIMESTAMP_MS, headers.timestamp_ms.to_string())
        .header(HDR_NONCE, headers.nonce)
        .header(HDR_BODY_SHA256, headers.body_sha256)
        .header(HDR_SIGNATURE, headers.signature_b64)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(bytes)
}

async fn enroll_worker(node: &TestNode, client: &reqwest::Client, worker: &NodeIdentity) {
    let resp = client
        .post(format!("{}/mesh/register", node.base))
        .json(&json!({
            "peer_id": worker.peer_id(),
            "public_key": worker.public_key_hex(),
            "coordinator_url": "http://127.0.0.1:1",
            "registration_token": "enroll-tok",
            "capability": {
                "sandbox_mode": "docker",
                "active_model": "mock-model",
                "active_model_param_size": 7.0,
                "current_load": 0,
                "mode": "swarm-only",
                "model_provider": "mock",
                "max_concurrent_tasks": 1,
                "swap_in_progress": false
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

fn ok_execution(task: &str) -> serde_json::Value {
    json!({
        "task": task,
        "language": "python",
        "iterations": 1,
        "history": [{
            "iteration": 1,
            "plan": "print it",
            "code": "print('hi')",
            "run_result": {
                "language": "python",
                "ok": true,
                "stdout": "hi\n",
                "stderr": "",
                "exit_code": 0,
                "duration_ms": 2000,
                "queue_for_cloud": false
            }
        }],
        "escalated": false
    })
}

#[tokio::test]
async fn status_and_health_are_open() {
    let node = start_node().await;
    let client = reqwest::Client::new();

    let status: serde_json::Value = client
        .get(format!("{}/status", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["peer_id"], "edge-coordinator");

    let health: serde_json::Value = client
        .get(format!("{}/health/runtime", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);
}

#[tokio::test]
async fn enrollment_requires_the_registration_token() {
    let node = start_node().await;
    let client = reqwest::Client::new();
    let worker = NodeIdentity::generate();

    let resp = client
        .post(format!("{}/mesh/register", node.base))
        .json(&json!({
            "peer_id": worker.peer_id(),
            "public_key": worker.public_key_hex(),
            "coordinator_url": "http://127.0.0.1:1",
            "registration_token": "wrong"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn unsigned_pull_is_rejected() {
    let node = start_node().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/pull", node.base))
        .json(&json!({"agent_id": "x", "model": "m", "os": "linux"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn full_task_cycle_with_settlement() {
    let node = start_node().await;
    let client = reqwest::Client::new();
    let worker = NodeIdentity::generate_with_id("edge-worker-1");
    enroll_worker(&node, &client, &worker).await;

    // Fund the requester, then submit.
    node.state
        .credits
        .adjust("requester-1", 100.0, "test funding")
        .await
        .unwrap();
    let submit: serde_json::Value = client
        .post(format!("{}/tasks", node.base))
        .json(&json!({
            "requester_account_id": "requester-1",
            "prompt": "Print hello world",
            "language": "python",
            "priority": 1
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = submit["task_id"].as_str().unwrap().to_string();
    assert_eq!(submit["subtask_count"], 1);

    // Escrow reduces the spendable balance immediately.
    let held_balance = node.state.credits.balance("requester-1").await;
    assert!(held_balance < 100.0, "escrow must reduce spendable balance");

    // Signed pull claims the subtask.
    let pull_body = json!({
        "agent_id": worker.peer_id(),
        "model": "mock-model",
        "os": "linux"
    });
    let pulled: serde_json::Value =
        signed(&client, &worker, &node.base, "/pull", &pull_body, "pull-nonce-1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    let subtask_id = pulled["subtask"]["subtask_id"].as_str().unwrap().to_string();
    assert_eq!(pulled["subtask"]["task_id"], task_id.as_str());

    // Second pull: nothing left → 204.
    let empty = signed(&client, &worker, &node.base, "/pull", &pull_body, "pull-nonce-2")
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 204);

    // Report the result; worker earns, requester pays, escrow closes.
    let report = json!({
        "subtask_id": subtask_id,
        "agent_id": worker.peer_id(),
        "report_id": "report-1",
        "execution": ok_execution("Print hello world"),
    });
    let result: serde_json::Value =
        signed(&client, &worker, &node.base, "/result", &report, "result-nonce-1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(result["task_status"], "settled");
    let credited = result["credited"].as_f64().unwrap();
    assert!(credited > 0.0);

    assert_eq!(node.state.credits.balance(worker.peer_id()).await, credited);
    assert_eq!(
        node.state.credits.balance("requester-1").await,
        100.0 - credited,
        "escrow released, actual cost debited"
    );

    // The ledger replays cleanly after the whole cycle.
    let verify: serde_json::Value = client
        .get(format!("{}/credits/ledger/verify", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verify["valid"], true);
}

#[tokio::test]
async fn replayed_nonce_is_rejected() {
    let node = start_node().await;
    let client = reqwest::Client::new();
    let worker = NodeIdentity::generate();
    enroll_worker(&node, &client, &worker).await;

    let body = json!({"agent_id": worker.peer_id(), "model": "m", "os": "linux"});
    let first = signed(&client, &worker, &node.base, "/pull", &body, "same-nonce")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 204, "empty queue, but authenticated");

    let replay = signed(&client, &worker, &node.base, "/pull", &body, "same-nonce")
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 401);
    let err: serde_json::Value = replay.json().await.unwrap();
    assert_eq!(err["error"], "signature_replay");
}

#[tokio::test]
async fn submit_without_funds_is_payment_required() {
    let node = start_node().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/tasks", node.base))
        .json(&json!({
            "requester_account_id": "broke-account",
            "prompt": "anything",
            "language": "python"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 402);
    let err: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(err["error"], "insufficient_credits");
}

#[tokio::test]
async fn handshake_review_negotiate_result_flow() {
    let node = start_node().await;
    let client = reqwest::Client::new();

    let review = client
        .post(format!("{}/review", node.base))
        .json(&json!({
            "agent_id": "agent-7",
            "task": {"task_id": "t-9", "prompt": "explain and fix", "language": "python"},
            "snippet": "print(x)",
            "error": "NameError: name 'x' is not defined",
            "queue_reason": "outside_subset"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(review.status(), 201);
    let review: serde_json::Value = review.json().await.unwrap();
    assert_eq!(review["phase"], "handshake");
    let session_id = review["session_id"].as_str().unwrap().to_string();

    let negotiated: serde_json::Value = client
        .post(format!("{}/negotiate", node.base))
        .json(&json!({
            "session_id": session_id,
            "agent_id": "agent-7",
            "accept": true
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(negotiated["phase"], "execute");

    // The mock provider answers immediately; poll briefly for the async
    // execution to land.
    let mut phase = String::new();
    let mut result = serde_json::Value::Null;
    for _ in 0..50 {
        result = client
            .get(format!("{}/result/{}", node.base, session_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        phase = result["phase"].as_str().unwrap_or_default().to_string();
        if phase == "result" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(phase, "result");
    assert!(result["cloud_response"].as_str().unwrap().contains("python"));
}

#[tokio::test]
async fn unknown_task_escalation_status_is_404() {
    let node = start_node().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/escalate/no-such-task", node.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
