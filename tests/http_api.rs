//! HTTP API tests, driven through the router without a socket

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use minishard::coordinator::http::{create_router, CoordState};
use minishard::coordinator::record::{CoordinatorPhase, OperationRecord};
use minishard::coordinator::store::MemCatalogStore;
use minishard::coordinator::ReshardingService;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn setup() -> (axum::Router, Arc<ReshardingService>) {
    let store = Arc::new(MemCatalogStore::new());
    seed_original(store.as_ref());
    let notifier = Arc::new(RecordingNotifier::default());
    let service = ReshardingService::new(deps(store, notifier), Duration::from_secs(3600));
    service.step_up().unwrap();
    let router = create_router(CoordState {
        service: service.clone(),
    });
    (router, service)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn start_body() -> Value {
    json!({
        "namespace": NAMESPACE,
        "new_shard_key": ["tenant", "id"],
        "donors": DONORS,
        "recipients": RECIPIENTS,
    })
}

#[tokio::test]
async fn test_start_then_assign_then_report() {
    let (router, service) = setup();

    let resp = router
        .clone()
        .oneshot(json_request("POST", "/reshard", start_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let record: OperationRecord = serde_json::from_value(body_json(resp).await).unwrap();
    let id = record.operation_id;
    assert_eq!(record.original_namespace, NAMESPACE);

    let resp = router
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/reshard/{}/assignment", id),
            serde_json::to_value(assignment()).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // A second assignment is refused
    let resp = router
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/reshard/{}/assignment", id),
            serde_json::to_value(assignment()).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let coord = service.get(&id).unwrap();
    wait_for_phase(&coord, CoordinatorPhase::Initialized).await;

    for shard in RECIPIENTS {
        let resp = router
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/reshard/{}/participants", id),
                json!({
                    "role": "recipient",
                    "id": shard,
                    "state": "created-collection",
                    "abort_reason": null,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
    wait_for_phase(&coord, CoordinatorPhase::PreparingToDonate).await;

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/reshard/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status = body_json(resp).await;
    assert_eq!(status["record"]["phase"], "preparing-to-donate");
    assert!(status["outcome"].is_null());
}

#[tokio::test]
async fn test_unknown_participant_is_bad_request() {
    let (router, service) = setup();
    let coord = service.start_operation(request(), None).unwrap();

    let resp = router
        .oneshot(json_request(
            "POST",
            &format!("/reshard/{}/participants", coord.operation_id()),
            json!({
                "role": "donor",
                "id": "shard-z",
                "state": "ready-to-donate",
                "min_fetch_timestamp": 5,
                "abort_reason": null,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_namespace_conflicts() {
    let (router, _service) = setup();
    let resp = router
        .clone()
        .oneshot(json_request("POST", "/reshard", start_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = router
        .oneshot(json_request("POST", "/reshard", start_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert!(body_json(resp).await["error"]
        .as_str()
        .unwrap()
        .contains(NAMESPACE));
}

#[tokio::test]
async fn test_abort_and_wait() {
    let (router, service) = setup();
    let coord = service.start_operation(request(), Some(assignment())).unwrap();
    let id = coord.operation_id();
    wait_for_phase(&coord, CoordinatorPhase::Initialized).await;

    let resp = router
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/reshard/{}/abort", id),
            json!({ "reason": "operator request" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = router
        .oneshot(
            Request::builder()
                .uri(format!("/reshard/{}/wait", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let outcome = body_json(resp).await;
    assert_eq!(outcome["status"], "failed");
    assert!(outcome["reason"]
        .as_str()
        .unwrap()
        .contains("operator request"));
}

#[tokio::test]
async fn test_missing_operation_is_not_found() {
    let (router, _service) = setup();
    let resp = router
        .oneshot(
            Request::builder()
                .uri(format!("/reshard/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (router, _service) = setup();

    let resp = router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health = body_json(resp).await;
    assert_eq!(health["holds_lease"], true);

    let resp = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("minishard_operations_started"));
}
