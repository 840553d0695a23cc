//! HTTP routes of the control API.

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::Rig;
use replay_rig::api::AppState;
use replay_rig::api::routes::create_router;
use replay_rig::config::SchedulerConfig;
use replay_rig::domain::RunState;

fn router(rig: &Rig) -> Router {
    create_router(AppState::new(rig.service.clone()))
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_add_and_list_jobs() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/jobs",
        Some(json!({
            "jobs": [
                { "job_name": "drive-1", "diagram_reference": rig.diagram, "replay_plugin_ref": "quick" },
                { "job_name": "drive-2", "diagram_reference": rig.diagram, "replay_plugin_ref": "quick" }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send(&router, Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|job| job["job_name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["drive-1", "drive-2"]);

    rig.wait_until_settled().await;
    let (_, body) = send(&router, Method::GET, "/api/states", None).await;
    assert_eq!(body[0]["overall_state"], "FINISHED");
    assert_eq!(body[0]["download_state"]["state"], "NOT_EXECUTED");
    assert_eq!(body[1]["current_job"]["job_name"], "drive-2");
}

#[tokio::test]
async fn test_invalid_jobs_are_reported_as_failure() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/jobs",
        Some(json!({ "jobs": [ { "job_name": "", "diagram_reference": rig.diagram } ] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("job_name"));
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(&router, Method::POST, "/api/jobs", Some(json!({ "job": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_delete_matching_route() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);
    rig.service
        .add_replay_jobs(vec![
            rig.replay_only("night-1", "quick"),
            rig.replay_only("day-1", "quick"),
        ])
        .await;
    rig.wait_until_settled().await;

    let (status, body) = send(&router, Method::DELETE, "/api/jobs/matching?pattern=night-.*", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let remaining = rig.service.get_all_replay_jobs().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].job_name, "day-1");

    let (status, body) = send(&router, Method::DELETE, "/api/jobs/matching?pattern=(", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);

    let (status, _) = send(&router, Method::DELETE, "/api/jobs/matching", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bulk_delete_routes() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);
    rig.service
        .add_replay_jobs(vec![rig.replay_only("a", "quick")])
        .await;
    rig.wait_until_settled().await;

    for uri in ["/api/jobs/pending", "/api/jobs/finished", "/api/jobs"] {
        let (status, body) = send(&router, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body["success"], true, "{uri}");
    }
    assert!(rig.service.get_all_replay_jobs().await.is_empty());
}

#[tokio::test]
async fn test_running_state_routes() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(&router, Method::GET, "/api/states/replay", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);

    rig.service
        .add_replay_jobs(vec![rig.replay_only("busy", "forever")])
        .await;
    rig.wait_until("busy to run", |states| {
        states[0].overall_state == RunState::Running
    })
    .await;

    let (_, body) = send(&router, Method::GET, "/api/states/replay", None).await;
    assert_eq!(body["current_job"]["job_name"], "busy");
    let (_, body) = send(&router, Method::GET, "/api/states/running", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    rig.store.shutdown().await;
}

#[tokio::test]
async fn test_start_unknown_job_fails() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(&router, Method::POST, "/api/jobs/nobody/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_health_and_volumes() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["jobs"], 0);

    let (status, body) = send(&router, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");

    let (status, body) = send(&router, Method::GET, "/api/volumes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_array());
}

#[tokio::test]
async fn test_unknown_route_and_missing_logging() {
    let rig = Rig::new(SchedulerConfig::default());
    let router = router(&rig);

    let (status, body) = send(&router, Method::GET, "/api/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, body) = send(&router, Method::GET, "/api/logging", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
}
