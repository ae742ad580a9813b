// Tests de l'API REST via tower::oneshot, sans socket

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use loggather_devkit::fixtures::{CBS_LOG, HOTFIX_COMMAND};
use loggather_devkit::{ClientBuilder, Reply, TestHarness};
use loggather_kernel::http::{build_router, AppState};
use loggather_kernel::models::SlotState;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

fn setup(api_key: Option<&str>) -> (TestHarness, Router) {
    let h = TestHarness::new(vec![ClientBuilder::standard("M1").build(), ClientBuilder::standard("M2").build()]);
    for target in ["M1", "M2"] {
        h.transport
            .script(target, CBS_LOG, vec![Reply::text(format!("{target} CBS Info: ok"))])
            .script(target, HOTFIX_COMMAND, vec![Reply::text(format!("{target} KB5034441"))]);
    }
    let router = build_router(AppState::new(h.kernel.clone(), api_key.map(str::to_string)));
    (h, router)
}

async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_submit_then_poll_until_completed() {
    let (h, router) = setup(None);

    let (status, body) = call(&router, post_json("/analyze", json!({ "target_names": ["M1", "M2"] }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["request_id"].as_str().unwrap().to_string();

    h.wait_for_terminal(&id, 5000).await.unwrap();
    let (status, body) = call(&router, get(&format!("/analyze/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["targets_done"], 2);
    assert_eq!(body["overall_status"], "ok");
    assert_eq!(body["analysis"]["targets"].as_array().unwrap().len(), 2);
    assert!(body["summary"].is_string());
}

#[tokio::test]
async fn test_legacy_client_names_field_is_accepted() {
    let (h, router) = setup(None);
    let (status, body) = call(&router, post_json("/analyze", json!({ "client_names": ["M2"], "include_summary": false }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = h.wait_for_terminal(body["request_id"].as_str().unwrap(), 5000).await.unwrap();
    assert_eq!(request.targets, vec!["M2"]);
    assert!(request.summary.is_none());
}

#[tokio::test]
async fn test_unknown_target_is_404_and_creates_nothing() {
    let (h, router) = setup(None);
    let (status, body) = call(&router, post_json("/analyze", json!({ "target_names": ["M1", "nope"] }))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "TargetNotFound");
    assert_eq!(body["unknown_targets"], json!(["nope"]));
    assert!(h.kernel.jobs.is_empty());
}

#[tokio::test]
async fn test_poll_unknown_request_reports_not_found() {
    let (_h, router) = setup(None);
    let (status, body) = call(&router, get("/analyze/unknown-id")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "not_found");
    assert_eq!(body["request_id"], "unknown-id");
}

#[tokio::test]
async fn test_running_request_cannot_be_deleted() {
    let (h, router) = setup(None);
    h.transport.hold("M1");
    let (_, body) = call(&router, post_json("/analyze", json!({ "target_names": ["M1"] }))).await;
    let id = body["request_id"].as_str().unwrap().to_string();

    let (status, _) = call(&router, Request::delete(format!("/analyze/{id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (_, running) = call(&router, get(&format!("/analyze/{id}"))).await;
    assert_eq!(running["status"], "running");
    assert_eq!(running["analysis"]["targets"], json!([]));
    assert!(running.get("action_items").is_none());

    h.transport.release("M1");
    h.wait_for_terminal(&id, 5000).await.unwrap();
    let (status, body) = call(&router, Request::delete(format!("/analyze/{id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _) = call(&router, get(&format!("/analyze/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_clients_and_latest_analysis() {
    let (h, router) = setup(None);
    let (status, body) = call(&router, get("/clients")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "M1");
    assert_eq!(body[1]["hostname"], "m2.test.local");
    assert_eq!(body[0]["status"], "unknown");
    assert!(body[0]["last_analyzed"].is_null());

    let (status, body) = call(&router, get("/clients/M1/analysis")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "no_analysis");

    let id = h.submit(&["M1"], false, false).unwrap();
    h.wait_for_terminal(&id, 5000).await.unwrap();
    let (status, body) = call(&router, get("/clients/M1/analysis")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target"], "M1");

    let (_, body) = call(&router, get("/clients")).await;
    assert_eq!(body[0]["status"], "info");
    assert!(body[0]["last_analyzed"].is_string());
    assert_eq!(body[1]["status"], "unknown");

    let (status, _) = call(&router, get("/clients/ghost/analysis")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_key_guards_everything_but_health() {
    let (_h, router) = setup(Some("s3cret"));

    let (status, _) = call(&router, get("/clients")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authed = Request::get("/clients").header("x-api-key", "s3cret").body(Body::empty()).unwrap();
    let (status, _) = call(&router, authed).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["llm_status"], "unknown");
}

#[tokio::test]
async fn test_health_reports_connected_targets() {
    let (h, router) = setup(None);
    let id = h.submit(&["M1", "M2"], false, false).unwrap();
    h.wait_for_terminal(&id, 5000).await.unwrap();

    let (_, body) = call(&router, get("/health")).await;
    assert_eq!(body["connected_clients"], 2);
    assert_eq!(body["system_metrics"]["active_analyses"], 0);
    assert_eq!(body["system_metrics"]["cache_size"], 4);
}

#[tokio::test]
async fn test_running_poll_shows_finished_targets() {
    let (h, router) = setup(None);
    h.transport.hold("M2");
    let (_, body) = call(&router, post_json("/analyze", json!({ "target_names": ["M1", "M2"] }))).await;
    let id = body["request_id"].as_str().unwrap().to_string();

    let m1_done = async {
        while h.kernel.orchestrator.get(&id).and_then(|r| r.slot("M1").map(|s| s.state)) != Some(SlotState::Done) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), m1_done).await.unwrap();

    let (_, running) = call(&router, get(&format!("/analyze/{id}"))).await;
    assert_eq!(running["status"], "running");
    assert_eq!(running["targets_done"], 1);
    let partial = running["analysis"]["targets"].as_array().unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0]["target"], "M1");
    assert_eq!(partial[0]["hostname"], "m1.test.local");
    assert_eq!(partial[0]["results"].as_array().unwrap().len(), 2);

    h.transport.release("M2");
    h.wait_for_terminal(&id, 5000).await.unwrap();
    let (_, done) = call(&router, get(&format!("/analyze/{id}"))).await;
    assert_eq!(done["analysis"]["targets"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_single_client_analyze_forces_refresh() {
    let (h, router) = setup(None);
    let first = h.submit(&["M1"], false, false).unwrap();
    h.wait_for_terminal(&first, 5000).await.unwrap();
    assert_eq!(h.analysis.analysis_calls(), 2);

    let (status, body) = call(&router, post_json("/clients/M1/analyze", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["target"], "M1");
    assert_eq!(body["status"], "started");

    let request = h.wait_for_terminal(body["request_id"].as_str().unwrap(), 5000).await.unwrap();
    assert_eq!(request.targets, vec!["M1"]);
    assert!(request.force_refresh);
    assert!(request.summary.is_some());
    // le cache est contourné
    assert_eq!(h.analysis.analysis_calls(), 4);

    let (status, _) = call(&router, post_json("/clients/ghost/analyze", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_raw_collect_route() {
    let (h, router) = setup(None);
    h.transport.script("M2", HOTFIX_COMMAND, vec![Reply::unreachable()]);

    let (status, body) = call(&router, post_json("/collect/M2", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target"], "M2");
    assert_eq!(body["success"], true);
    let logs = body["log_results"].as_array().unwrap();
    assert_eq!(logs[0]["content"], "M2 CBS Info: ok");
    assert_eq!(logs[0]["lines_count"], 1);
    assert_eq!(logs[1]["success"], false);
    assert!(logs[1]["error"].is_string());
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    assert_eq!(h.analysis.analysis_calls(), 0);

    let (status, _) = call(&router, post_json("/collect/ghost", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.transport.hold("M1");
    let id = h.submit(&["M1"], false, false).unwrap();
    let (status, body) = call(&router, post_json("/collect/M1", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["request_id"], id.as_str());
    h.transport.release("M1");
}
