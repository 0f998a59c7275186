//! End-to-end HTTP-surface scenario tests, driving the real Axum router
//! wiring against a [`ScriptedAdapter`] so no network I/O is needed.
//! Grounded on the teacher's `tests/integration_*.rs` style
//! (`tower::ServiceExt::oneshot` against a constructed `Router`).

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use http_body_util::BodyExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tower::ServiceExt;

use modelrouter_rust::budget::BudgetStore;
use modelrouter_rust::config::Config;
use modelrouter_rust::db::Database;
use modelrouter_rust::health::HealthStore;
use modelrouter_rust::router::{self, AppState, ScriptedAdapterSource};
use modelrouter_rust::session::SessionStore;

fn write_config(dir: &tempfile::TempDir, models: Value, policies: Value) -> String {
    let config_path = dir.path().join("config.json");
    let db_path = dir.path().join("state.sqlite");
    let config = json!({
        "models": models,
        "providers": [
            { "name": "openai", "base_url": "http://example.invalid", "api_key": "test" },
            { "name": "google", "base_url": "http://example.invalid", "api_key": "test" }
        ],
        "policies": policies,
        "db_path": db_path.to_string_lossy(),
        "admin_token": "secret-token",
    });
    std::fs::write(&config_path, config.to_string()).unwrap();
    config_path.to_string_lossy().to_string()
}

fn model(id: &str, provider: &str) -> Value {
    json!({
        "id": id,
        "provider": provider,
        "backend": id,
        "capabilities": { "code": 4, "reasoning": 4 },
        "cost_weight": 0.5,
    })
}

fn test_app(config_path: &str) -> (Router, ScriptedAdapterSource) {
    let config = Config::from_file(config_path).unwrap();
    let db = Arc::new(Database::open(config.db_path()).unwrap());
    let adapters = ScriptedAdapterSource::new();

    let state = AppState {
        config: Arc::new(RwLock::new(config)),
        config_path: Arc::new(config_path.to_string()),
        health: Arc::new(HealthStore::new(db.clone())),
        budget: Arc::new(BudgetStore::new(db.clone())),
        session: Arc::new(SessionStore::new(db)),
        adapters: Arc::new(adapters.clone()),
        active_stream: Arc::new(AtomicI64::new(0)),
        active_nonstream: Arc::new(AtomicI64::new(0)),
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(router::chat_completions_handler))
        .route("/v1/responses", post(router::responses_handler))
        .route("/admin/reload", post(router::admin_reload_handler))
        .with_state(state);

    (app, adapters)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Rate-limit failover: the preferred candidate throws RATE_LIMIT, the
/// next one succeeds with a fenced code block.
#[tokio::test]
async fn rate_limit_failover_returns_healthy_candidate_text() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        json!([model("a", "openai"), model("b", "openai")]),
        json!({ "default": { "preferred": ["a", "b"], "quality_threshold": 0.5, "max_wait_ms": 5000 } }),
    );
    let (app, adapters) = test_app(&config_path);
    adapters.adapter.script(
        "a",
        vec![modelrouter_rust::provider::ScriptedOutcome::Error(
            modelrouter_rust::provider::ScriptedError::RateLimit(Some(std::time::Duration::from_secs(10))),
        )],
    );
    adapters.adapter.script(
        "b",
        vec![modelrouter_rust::provider::ScriptedOutcome::Text("```ts\nfn ok() {}\n```".to_string())],
    );

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-router-task-type", "code")
        .body(Body::from(
            json!({ "messages": [{ "role": "user", "content": "there is a bug, please fix" }] }).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["model"], "b");
    assert!(body["choices"][0]["message"]["content"].as_str().unwrap().contains("```ts"));
}

/// Both candidates always refuse; threshold is unreachable within the
/// wall-clock budget, so the client sees a 503 with
/// `retry_after_ms=10000`.
#[tokio::test]
async fn timeout_surfaces_503_with_retry_after() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        json!([model("a", "openai"), model("b", "openai")]),
        json!({ "default": { "quality_threshold": 0.9, "max_wait_ms": 20, "poll_interval_ms": 5 } }),
    );
    let (app, adapters) = test_app(&config_path);
    adapters
        .adapter
        .script("a", vec![modelrouter_rust::provider::ScriptedOutcome::Text("I cannot help with that.".into())]);
    adapters
        .adapter
        .script("b", vec![modelrouter_rust::provider::ScriptedOutcome::Text("I cannot help with that either.".into())]);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "messages": [{ "role": "user", "content": "please help" }] }).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "no_suitable_model_available");
    assert_eq!(body["error"]["retry_after_ms"], 10_000);
}

/// A tool-calling response forces non-streaming delivery even though the
/// request asked for `stream=true`.
#[tokio::test]
async fn tool_call_response_suppresses_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        json!([model("a", "openai")]),
        json!({ "default": { "quality_threshold": 0.3, "max_wait_ms": 5000 } }),
    );
    let (app, adapters) = test_app(&config_path);
    adapters.adapter.script(
        "a",
        vec![modelrouter_rust::provider::ScriptedOutcome::ToolCall(json!([
            { "id": "call_1", "type": "function", "function": { "name": "get_weather", "arguments": "{}" } }
        ]))],
    );

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "messages": [{ "role": "user", "content": "what's the weather" }], "stream": true }).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").cloned();
    assert!(content_type.is_none() || !content_type.unwrap().to_str().unwrap().contains("event-stream"));
    let body = body_json(response).await;
    assert!(body["choices"][0]["message"]["tool_calls"].is_array());
}

/// Resume idempotence: a second request with the same id and
/// `resume=true`, matching the admin token, returns the cached text without
/// invoking the adapter at all.
#[tokio::test]
async fn resume_with_admin_token_returns_cached_response_without_adapter_call() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        json!([model("a", "openai")]),
        json!({ "default": { "quality_threshold": 0.3, "max_wait_ms": 5000 } }),
    );
    let (app, adapters) = test_app(&config_path);
    adapters
        .adapter
        .script("a", vec![modelrouter_rust::provider::ScriptedOutcome::Text("```ts\nfn ok() {}\n```".into())]);

    let first = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-router-request-id", "req-resume-1")
        .body(Body::from(json!({ "messages": [{ "role": "user", "content": "fix this bug" }] }).to_string()))
        .unwrap();
    let first_response = app.clone().oneshot(first).await.unwrap();
    assert_eq!(first_response.status(), StatusCode::OK);
    let first_body = body_json(first_response).await;

    // Exhaust the scripted queue so a second adapter call would return an
    // empty string instead of the fenced block - proving resume never calls it.
    adapters.adapter.script("a", vec![modelrouter_rust::provider::ScriptedOutcome::Text(String::new())]);

    let second = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-router-request-id", "req-resume-1")
        .header("x-router-resume", "true")
        .header("x-router-admin-token", "secret-token")
        .body(Body::from(json!({ "messages": [{ "role": "user", "content": "fix this bug" }] }).to_string()))
        .unwrap();
    let second_response = app.oneshot(second).await.unwrap();
    assert_eq!(second_response.status(), StatusCode::OK);
    let second_body = body_json(second_response).await;

    assert_eq!(first_body["choices"][0]["message"]["content"], second_body["choices"][0]["message"]["content"]);
}

/// Resume without a valid admin token is rejected; resume is admin-only.
#[tokio::test]
async fn resume_without_admin_token_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        json!([model("a", "openai")]),
        json!({ "default": { "quality_threshold": 0.3, "max_wait_ms": 5000 } }),
    );
    let (app, _adapters) = test_app(&config_path);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-router-resume", "true")
        .body(Body::from(json!({ "messages": [{ "role": "user", "content": "hi" }] }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

/// Admin reload is gated by the same shared-secret header.
#[tokio::test]
async fn admin_reload_rejects_wrong_token() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, json!([model("a", "openai")]), json!({}));
    let (app, _adapters) = test_app(&config_path);

    let request = Request::builder()
        .method("POST")
        .uri("/admin/reload")
        .header("x-router-admin-token", "wrong")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

/// Budget exclusion: provider `openai` is already at its hard limit, so
/// the first (and only) successful attempt is against B on
/// `google`.
#[tokio::test]
async fn budget_exclusion_routes_around_hard_limited_provider() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        json!([model("a", "openai"), model("b", "google")]),
        json!({ "default": { "quality_threshold": 0.3, "max_wait_ms": 5000 } }),
    );
    let (app, adapters) = test_app(&config_path);
    let config = Config::from_file(&config_path).unwrap();
    let db = Arc::new(Database::open(config.db_path()).unwrap());
    let budget = BudgetStore::new(db);
    budget.ensure_limits("openai", None, Some(10));
    budget.record("openai", 10);

    adapters
        .adapter
        .script("b", vec![modelrouter_rust::provider::ScriptedOutcome::Text("```ts\nfn ok() {}\n```".into())]);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-router-task-type", "code")
        .body(Body::from(json!({ "messages": [{ "role": "user", "content": "there is a bug" }] }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["model"], "b");
}
