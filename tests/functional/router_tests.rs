//! End-to-end tests of the `/mutate` endpoint.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use nsm_admission_webhook::WebhookState;
use nsm_admission_webhook::webhooks::create_webhook_router;

use crate::common::fixtures::*;

async fn post_review(body: Value) -> (StatusCode, Value) {
    let namespaces = FakeNamespaces::new().with(namespace(NAMESPACE, &[], &[]));
    let router = create_webhook_router(Arc::new(WebhookState::new(reviewer(Arc::new(
        namespaces,
    )))));

    let response = router
        .oneshot(
            Request::post("/mutate")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn review(kind: &str, object: Value) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "c0ffee00-6393-11e8-b7cc-42010a800002",
            "kind": { "group": "apps", "version": "v1", "kind": kind },
            "resource": { "group": "apps", "version": "v1", "resource": "deployments" },
            "operation": "CREATE",
            "namespace": NAMESPACE,
            "name": "nginx",
            "userInfo": {},
            "object": object
        }
    })
}

#[tokio::test]
async fn test_mutate_returns_json_patch() {
    let deployment = WorkloadBuilder::new("Deployment", "nginx")
        .annotation(ANNOTATION, "kernel://icmp-responder/nsm-1")
        .build();

    let (status, body) = post_review(review("Deployment", deployment)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["apiVersion"], "admission.k8s.io/v1");
    assert_eq!(body["kind"], "AdmissionReview");

    let response = &body["response"];
    assert_eq!(response["uid"], "c0ffee00-6393-11e8-b7cc-42010a800002");
    assert_eq!(response["allowed"], true);
    assert_eq!(response["patchType"], "JSONPatch");

    // kube serializes the patch bytes as a JSON array of numbers
    let patch: Vec<u8> = serde_json::from_value(response["patch"].clone()).unwrap();
    let ops: Vec<Value> = serde_json::from_slice(&patch).unwrap();
    assert_eq!(ops.len(), 4);
    assert!(ops.iter().all(|op| op["op"] == "add"));
}

#[tokio::test]
async fn test_mutate_without_directive_has_no_patch() {
    let deployment = WorkloadBuilder::new("Deployment", "nginx").build();

    let (status, body) = post_review(review("Deployment", deployment)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"]["allowed"], true);
    assert!(body["response"].get("patch").is_none());
}

#[tokio::test]
async fn test_mutate_rejects_review_without_request() {
    let (status, body) = post_review(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview"
    }))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["response"]["allowed"], false);
}
