//! Exercises [`HttpProviderAdapter`] against a real (mocked) HTTP server,
//! verifying the OpenAI-Chat-Completions wire shape and the adapter error
//! taxonomy classification. Grounded on the teacher's wiremock-backed
//! integration tests.

use modelrouter_rust::error::AdapterError;
use modelrouter_rust::provider::{HttpProviderAdapter, ProviderAdapter};
use modelrouter_rust::types::Message;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn generate_parses_normalized_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "hello there" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 },
        })))
        .mount(&server)
        .await;

    let adapter = HttpProviderAdapter::new(reqwest::Client::new(), server.uri(), "test-key");
    let resp = adapter
        .generate("gpt-x", &[Message::user("hi")], None, None, None, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resp.text, "hello there");
    assert_eq!(resp.usage.unwrap().total_tokens, 15);
}

#[tokio::test]
async fn generate_classifies_429_as_rate_limit_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let adapter = HttpProviderAdapter::new(reqwest::Client::new(), server.uri(), "test-key");
    let err = adapter
        .generate("gpt-x", &[Message::user("hi")], None, None, None, None, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        AdapterError::RateLimit { retry_after } => {
            assert_eq!(retry_after, Some(std::time::Duration::from_secs(7)));
        }
        other => panic!("expected RateLimit, got {other:?}"),
    }
}

#[tokio::test]
async fn generate_classifies_5xx_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let adapter = HttpProviderAdapter::new(reqwest::Client::new(), server.uri(), "test-key");
    let err = adapter
        .generate("gpt-x", &[Message::user("hi")], None, None, None, None, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::Transient(_)));
}

#[tokio::test]
async fn generate_classifies_context_length_exceeded_sentinel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "{\"error\": \"This model's maximum context length is 4096 tokens\"}",
        ))
        .mount(&server)
        .await;

    let adapter = HttpProviderAdapter::new(reqwest::Client::new(), server.uri(), "test-key");
    let err = adapter
        .generate("gpt-x", &[Message::user("hi")], None, None, None, None, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_context_length_exceeded());
}

#[tokio::test]
async fn generate_classifies_402_as_quota_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(402))
        .mount(&server)
        .await;

    let adapter = HttpProviderAdapter::new(reqwest::Client::new(), server.uri(), "test-key");
    let err = adapter
        .generate("gpt-x", &[Message::user("hi")], None, None, None, None, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::QuotaExceeded));
}
