//! Test utilities and common setup.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, header};
use petchat::api;
use petchat::bridge::{BridgeConfig, ChatBridge};
use serde_json::Value;
use tower::ServiceExt;

/// Path of the stub worker built alongside the tests.
pub const STUB_WORKER: &str = env!("CARGO_BIN_EXE_petchat-stub-worker");

/// Bridge configuration running the stub worker with the given arguments.
pub fn stub_config(args: &[&str]) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.worker.program = STUB_WORKER.to_string();
    config.worker.args = args.iter().map(|arg| arg.to_string()).collect();
    config.call_timeout_secs = 5;
    config.stream_timeout_secs = 5;
    config
}

/// Bridge running the stub worker with the given arguments.
pub fn stub_bridge(args: &[&str]) -> Arc<ChatBridge> {
    Arc::new(ChatBridge::new(stub_config(args)).unwrap())
}

/// Create a test application backed by an echoing stub worker.
pub fn test_app() -> Router {
    test_app_with(stub_bridge(&["--behavior", "echo"]))
}

pub fn test_app_with(bridge: Arc<ChatBridge>) -> Router {
    api::create_router(api::AppState::new(bridge))
}

pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

/// Parse the `data:` payloads of a server-sent event body.
pub fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}
