use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Value, json};

use specscout_infra::config::AppConfig;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same wiring as prod (in-memory transport, scripted source), ephemeral port.
        let services = specscout_api::app::services::build_services(&AppConfig::default())
            .await
            .expect("failed to build services");
        let app = specscout_api::app::build_app(Arc::new(services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    async fn rpc(&self, method: &str, params: Value) -> (StatusCode, Value) {
        let res = reqwest::Client::new()
            .post(format!("{}/rpc", self.base_url))
            .json(&json!({ "id": 1, "method": method, "params": params }))
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }

    /// Full SSE body of a streamed call, decoded into its `data` frames.
    async fn stream(&self, method: &str, params: Value) -> Vec<Value> {
        let res = reqwest::Client::new()
            .post(format!("{}/rpc/stream", self.base_url))
            .json(&json!({ "id": "s1", "method": method, "params": params }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = tokio::time::timeout(std::time::Duration::from_secs(10), res.text())
            .await
            .expect("stream did not end")
            .unwrap();

        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).unwrap())
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_job_eventually(srv: &TestServer, job_id: &str, status: &str) -> Value {
    // Workers run in the background; poll until the job settles.
    for _ in 0..200 {
        let (code, body) = srv.rpc("bulk.get", json!({ "jobId": job_id })).await;
        assert_eq!(code, StatusCode::OK);
        if body["result"]["job"]["status"] == status {
            return body["result"].clone();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("job {job_id} did not reach {status} within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn unknown_methods_are_reported_with_the_request_id() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.rpc("bulk.explode", json!({})).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["id"], 1);
    assert_eq!(body["error"]["code"], "method_not_found");
}

#[tokio::test]
async fn bulk_job_lifecycle_start_get_list() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv
        .rpc(
            "bulk.start",
            json!({ "jobType": "scrape", "slugs": ["pixel-9", "galaxy-s24", "iphone-16"], "workerCount": 2 }),
        )
        .await;
    if status != StatusCode::OK {
        panic!("expected 200 OK from bulk.start, got {status} body={body}");
    }
    let job_id = body["result"]["job"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["result"]["job"]["filter"], "slugs");
    assert_eq!(body["result"]["stats"]["total"], 3);

    let done = get_job_eventually(&srv, &job_id, "done").await;
    assert_eq!(done["stats"]["done"], 3);
    assert_eq!(done["stats"]["error"], 0);

    let (_, listed) = srv.rpc("bulk.list", Value::Null).await;
    let jobs = listed["result"]["jobs"].as_array().unwrap();
    assert!(jobs.iter().any(|j| j["job"]["id"] == job_id.as_str()));
}

#[tokio::test]
async fn subscribe_streams_until_the_job_is_done() {
    let srv = TestServer::spawn().await;

    let (_, body) = srv
        .rpc("bulk.start", json!({ "jobType": "scrape", "slugs": ["pixel-9", "pixel-8"] }))
        .await;
    let job_id = body["result"]["job"]["id"].as_str().unwrap().to_string();

    let frames = srv.stream("bulk.subscribe", json!({ "jobId": job_id })).await;

    assert!(frames.iter().all(|f| f["id"] == "s1"));
    // Either live events ending in bulk.done, or the final snapshot of a finished job.
    let last = frames.last().unwrap();
    let finished = last["event"]["event"]["type"] == "bulk.done" || last["result"]["job"]["status"] == "done";
    assert!(finished, "unexpected last frame: {last}");
}

#[tokio::test]
async fn scrape_streams_events_then_the_result() {
    let srv = TestServer::spawn().await;

    let frames = srv.stream("scrape", json!({ "slug": "pixel-9" })).await;

    let (last, events) = frames.split_last().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|f| f.get("event").is_some()));
    assert_eq!(last["result"]["slug"], "pixel-9");
    assert_eq!(last["result"]["data"]["brand"], "pixel");
}

#[tokio::test]
async fn lifecycle_calls_on_unknown_jobs_are_not_found() {
    let srv = TestServer::spawn().await;
    let missing = "0190c9a4-7f3e-7000-8000-000000000000";

    for method in ["bulk.pause", "bulk.resume", "bulk.get"] {
        let (status, body) = srv.rpc(method, json!({ "jobId": missing })).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method}");
        assert_eq!(body["error"]["code"], "not_found");
    }
}

#[tokio::test]
async fn malformed_params_are_invalid_params() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.rpc("bulk.start", json!({ "jobType": "teleport" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_params");

    let (status, body) = srv.rpc("scrape", json!({ "slug": "pixel-9" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_params");
}

#[tokio::test]
async fn finished_jobs_reject_pause() {
    let srv = TestServer::spawn().await;

    let (_, body) = srv
        .rpc("bulk.start", json!({ "jobType": "scrape", "slugs": ["pixel-9"] }))
        .await;
    let job_id = body["result"]["job"]["id"].as_str().unwrap().to_string();
    get_job_eventually(&srv, &job_id, "done").await;

    let (status, body) = srv.rpc("bulk.pause", json!({ "jobId": job_id })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_state");
}
