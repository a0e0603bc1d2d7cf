// SPDX-License-Identifier: MIT OR Apache-2.0
//! Gateway API tests over the in-memory platform backends.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;
use tp_broker::{Broker, InProcessBroker};
use tp_config::SenderSettings;
use tp_core::ComputationState;
use tp_gateway::{build_app, AppState};
use tp_object_store::MemoryStorage;
use tp_sender::Sender;
use tp_store::MemoryStore;

fn app() -> (axum::Router, Arc<AppState>) {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(MemoryStorage::new());
    let broker = InProcessBroker::new(store.clone());
    let sender = Sender::new(
        store.clone(),
        Arc::new(broker.clone()),
        SenderSettings::default(),
    );
    let state = Arc::new(AppState {
        sender,
        broker: Arc::new(broker),
        store,
        storage,
    });
    (build_app(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _state) = app();
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn plugin_listing_is_empty_without_registrations() {
    let (app, _state) = app();
    let response = app
        .oneshot(Request::get("/plugin").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!([]));
}

#[tokio::test]
async fn unknown_plugin_is_404() {
    let (app, _state) = app();
    let response = app
        .oneshot(Request::get("/plugin/ghost").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Plugin ghost does not exist.");
}

#[tokio::test]
async fn compute_on_offline_plugin_is_404_and_closes_the_stream() {
    let (app, state) = app();
    let mut events = state.broker.subscribe(None);

    let request_body = serde_json::json!({
        "aoi": {
            "type": "Feature",
            "geometry": {
                "type": "MultiPolygon",
                "coordinates": [[[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]]
            },
            "properties": {"name": "Box", "id": "box-1"}
        },
        "params": {"id": 1}
    });
    let response = app
        .oneshot(
            Request::post("/plugin/ghost")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "The plugin is not online.");

    // Subscribers of the allocated uuid observe closure.
    let event = events.recv().await.unwrap();
    assert_eq!(event.status, ComputationState::Failure);
}

#[tokio::test]
async fn artifact_listing_for_unknown_computation_is_empty() {
    let (app, _state) = app();
    let uuid = uuid::Uuid::new_v4();
    let response = app
        .oneshot(
            Request::get(format!("/store/{uuid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!([]));
}

#[tokio::test]
async fn missing_artifact_file_is_404() {
    let (app, _state) = app();
    let uuid = uuid::Uuid::new_v4();
    let response = app
        .oneshot(
            Request::get(format!("/store/{uuid}/ghost?file_name=ghost.md"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
