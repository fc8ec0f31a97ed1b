// HTTP-level tests for the statistics API, driven through tower's oneshot
// without opening sockets.

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use interfaces::defs::Item;
use serde_json::Value;
use source_poller::api::{self, ApiState};
use source_poller::{SourceStats, Statistics, StatsState};
use tower::ServiceExt as _;

const BODY_LIMIT: usize = 1024 * 1024;

fn app(stats: Arc<StatsState>) -> Router {
    api::router(ApiState::new(stats, 100))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_returns_ok() {
    let resp = app(Arc::new(StatsState::new())).oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn stats_returns_current_snapshot() {
    let state = Arc::new(StatsState::new());
    let mut stats = Statistics::empty(state.start_time());
    stats.total_items = 5;
    stats.top_authors.insert("ferris".to_string(), 5);
    state.publish(stats);

    let resp = app(state).oneshot(get("/api/stats")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["total_items"], 5);
    assert_eq!(body["top_authors"]["ferris"], 5);
    assert!(body["source_stats"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn source_stats_found_and_missing() {
    let state = Arc::new(StatsState::new());
    let mut stats = Statistics::empty(state.start_time());
    stats.source_stats.insert(
        "rust".to_string(),
        SourceStats {
            item_count: 2,
            top_item: Item::new("abc", "rust", "ferris", 40),
        },
    );
    state.publish(stats);

    let resp = app(state.clone()).oneshot(get("/api/stats/rust")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["item_count"], 2);
    assert_eq!(body["top_item"]["id"], "abc");

    let resp = app(state).oneshot(get("/api/stats/golang")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "No statistics available for source golang");
}

#[tokio::test]
async fn second_immediate_request_is_throttled() {
    let app = app(Arc::new(StatsState::new()));

    let first = app.clone().oneshot(get("/api/stats")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/api/stats")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(second).await;
    assert_eq!(body, serde_json::json!({ "error": "Rate limit exceeded, please try again later" }));
}

fn get_from(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn clients_are_limited_independently() {
    let app = app(Arc::new(StatsState::new()));

    let first = app.clone().oneshot(get_from("/healthz", "203.0.113.1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let other = app.clone().oneshot(get_from("/healthz", "203.0.113.2")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    let repeat = app.oneshot(get_from("/healthz", "203.0.113.1")).await.unwrap();
    assert_eq!(repeat.status(), StatusCode::TOO_MANY_REQUESTS);
}
