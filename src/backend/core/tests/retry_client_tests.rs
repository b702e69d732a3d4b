//! Integration tests for the rate-limited retry client against a mock
//! upstream generation API.
//!
//! Tests cover:
//! - Retry on 429 and 5xx, then success
//! - Fail-fast on terminal 4xx
//! - Retry exhaustion producing a failure outcome, not an error
//! - Hard per-call timeout aborting a hung upstream
//! - The shared token bucket pacing concurrent units

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use atelier_core::config::GenerationConfig;
use atelier_core::generation::{
    GenerationClient, GenerationRequest, HttpImageGenerator, RateLimiter, RetryPolicy,
};

fn generation_config(base_url: &str) -> GenerationConfig {
    GenerationConfig {
        base_url: base_url.to_string(),
        api_key: "test-key".to_string(),
        ..Default::default()
    }
}

fn client_with(
    server: &MockServer,
    max_attempts: u32,
    call_timeout: Duration,
) -> GenerationClient {
    let generator = Arc::new(HttpImageGenerator::new(&generation_config(&server.uri())).unwrap());
    GenerationClient::new(
        generator,
        Arc::new(RateLimiter::new(100, 100, Duration::from_secs(1))),
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            jitter: 0.2,
        },
        call_timeout,
    )
}

fn request() -> GenerationRequest {
    GenerationRequest {
        prompt: "an ink sketch of a harbor".to_string(),
        reference_images: vec![],
        size: "1024x1024".to_string(),
    }
}

fn success_body() -> serde_json::Value {
    serde_json::json!({ "url": "https://img.provider.example/out/1.png" })
}

// ============================================================================
// Retryable Failures
// ============================================================================

#[tokio::test]
async fn test_rate_limited_then_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(&server, 3, Duration::from_secs(5));
    let outcome = client.generate_unit(0, &request()).await;

    assert!(outcome.is_success(), "outcome: {:?}", outcome.result);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(
        outcome.result.unwrap().url,
        "https://img.provider.example/out/1.png"
    );
}

#[tokio::test]
async fn test_server_error_then_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    let client = client_with(&server, 3, Duration::from_secs(5));
    let outcome = client.generate_unit(0, &request()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test]
async fn test_retries_exhausted_is_a_failure_outcome() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_with(&server, 3, Duration::from_secs(5));
    let outcome = client.generate_unit(7, &request()).await;

    // The caller aggregates unit failures; generate_unit never errors.
    assert!(!outcome.is_success());
    assert_eq!(outcome.index, 7);
    assert_eq!(outcome.attempts, 3);
}

// ============================================================================
// Terminal Failures
// ============================================================================

#[tokio::test]
async fn test_client_error_fails_fast() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(&server, 3, Duration::from_secs(5));
    let outcome = client.generate_unit(0, &request()).await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 1, "4xx must not be retried");
}

#[tokio::test]
async fn test_auth_failure_fails_fast() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_with(&server, 3, Duration::from_secs(5));
    let outcome = client.generate_unit(0, &request()).await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 1);
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_hung_upstream_is_aborted_by_call_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(success_body())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let client = client_with(&server, 2, Duration::from_millis(200));

    let started = std::time::Instant::now();
    let outcome = client.generate_unit(0, &request()).await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.result.unwrap_err().contains("ProviderTimeout"));
    // Two aborted attempts plus backoff, nowhere near the 30s delay.
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Shared Rate Limit
// ============================================================================

#[tokio::test]
async fn test_token_bucket_paces_concurrent_units() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
        .mount(&server)
        .await;

    // 2 tokens, refilled 2 per 100ms: 6 units need at least ~200ms.
    let generator = Arc::new(HttpImageGenerator::new(&generation_config(&server.uri())).unwrap());
    let client = Arc::new(GenerationClient::new(
        generator,
        Arc::new(RateLimiter::new(2, 2, Duration::from_millis(100))),
        RetryPolicy::default(),
        Duration::from_secs(5),
    ));

    let started = std::time::Instant::now();
    let mut handles = Vec::new();
    for index in 0..6 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.generate_unit(index, &request()).await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "six units through a 2-token bucket cannot finish instantly"
    );
}
