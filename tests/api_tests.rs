use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use cron_lite::logs::{LogEntry, LogStore, MemLogStore};
use cron_lite::master::{router, ApiState, JobManager};
use cron_lite::store::{CoordinationStore, MemStore, JOB_KILLER_DIR, JOB_WORKER_DIR};

fn create_test_app() -> (Router, MemStore, MemLogStore) {
    let store = MemStore::new();
    let logs = MemLogStore::new();
    let state = ApiState {
        jobs: JobManager::new(Arc::new(store.clone()), 1),
        logs: Arc::new(logs.clone()),
    };
    (router(state), store, logs)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_save_and_list_jobs() {
    let (app, _store, _logs) = create_test_app();

    let job = json!({"name": "job1", "command": "echo hello", "cronExpr": "*/5 * * * * *"});
    let (status, body) = send(&app, post("/job/save", job.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errno"], 0);
    assert_eq!(body["data"], Value::Null);

    let (status, body) = send(&app, get("/job/list")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([job]));
}

#[tokio::test]
async fn test_save_returns_previous_job() {
    let (app, _store, _logs) = create_test_app();

    let v1 = json!({"name": "job1", "command": "echo v1", "cronExpr": "* * * * *"});
    let v2 = json!({"name": "job1", "command": "echo v2", "cronExpr": "* * * * *"});
    send(&app, post("/job/save", v1.clone())).await;

    let (_, body) = send(&app, post("/job/save", v2)).await;
    assert_eq!(body["data"], v1);
}

#[tokio::test]
async fn test_save_rejects_invalid_cron() {
    let (app, store, _logs) = create_test_app();

    let job = json!({"name": "bad", "command": "true", "cronExpr": "whenever"});
    let (status, body) = send(&app, post("/job/save", job)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errno"], -1);
    assert!(body["msg"].as_str().unwrap().contains("whenever"));
    assert!(store.get_prefix("/cron/jobs/").await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn test_delete_job() {
    let (app, _store, _logs) = create_test_app();

    let job = json!({"name": "job1", "command": "true", "cronExpr": "* * * * *"});
    send(&app, post("/job/save", job.clone())).await;

    let (status, body) = send(&app, post("/job/delete", json!({"name": "job1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], job);

    let (_, body) = send(&app, get("/job/list")).await;
    assert_eq!(body["data"], json!([]));

    let (_, body) = send(&app, post("/job/delete", json!({"name": "job1"}))).await;
    assert_eq!(body["errno"], 0);
    assert_eq!(body["data"], Value::Null);
}

#[tokio::test]
async fn test_kill_writes_short_lived_marker() {
    let (app, store, _logs) = create_test_app();

    let (status, body) = send(&app, post("/job/kill", json!({"name": "job1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errno"], 0);

    let markers = store.get_prefix(JOB_KILLER_DIR).await.unwrap();
    assert_eq!(markers.kvs.len(), 1);
    assert_eq!(markers.kvs[0].key, "/cron/killer/job1");
    assert_ne!(markers.kvs[0].lease, 0);
}

#[tokio::test]
async fn test_job_log_newest_first_with_paging() {
    let (app, _store, logs) = create_test_app();

    let entries: Vec<LogEntry> = (0..5)
        .map(|i| {
            let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, i).unwrap();
            LogEntry {
                job_name: "job1".to_string(),
                command: "echo hi".to_string(),
                err: String::new(),
                output: format!("run {}", i),
                plan_time: t,
                schedule_time: t,
                start_time: t,
                end_time: t,
            }
        })
        .collect();
    logs.insert_many(&entries).await.unwrap();

    let (status, body) = send(&app, get("/job/log?name=job1")).await;
    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(data[0]["output"], "run 4");
    assert_eq!(data[0]["startTime"], 1_714_564_804_000i64);

    let (_, body) = send(&app, get("/job/log?name=job1&skip=1&limit=2")).await;
    let outputs: Vec<_> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["output"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(outputs, vec!["run 3", "run 2"]);
}

#[tokio::test]
async fn test_worker_list() {
    let (app, store, _logs) = create_test_app();

    let lease = store.grant_lease(10).await.unwrap();
    for addr in ["10.0.0.1", "10.0.0.2"] {
        store
            .put(&format!("{}{}", JOB_WORKER_DIR, addr), Vec::new(), Some(lease))
            .await
            .unwrap();
    }

    let (status, body) = send(&app, get("/worker/list")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["10.0.0.1", "10.0.0.2"]));
}
