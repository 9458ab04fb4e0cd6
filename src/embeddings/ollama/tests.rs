use super::*;
use crate::config::OllamaConfig;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server: &MockServer, dimension: u32) -> OllamaConfig {
    let addr = server.address();
    OllamaConfig {
        protocol: "http".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        model: "test-model".to_string(),
        batch_size: 2,
        embedding_dimension: dimension,
    }
}

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        embedding_dimension: 384,
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model, "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.dimension(), 384);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
}

#[test]
fn client_builder_methods() {
    let config = OllamaConfig::default();
    let client = OllamaClient::new(&config)
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_attempts(5);

    assert_eq!(client.retry_attempts, 5);
}

#[test]
fn empty_text_maps_to_zero_vector_without_backend() {
    // Points at a port nothing listens on; an HTTP call would fail loudly.
    let config = OllamaConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        embedding_dimension: 64,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    let embedding = client.embed("").expect("empty text should not error");
    assert_eq!(embedding, vec![0.0; 64]);

    let embedding = client.embed("   ").expect("whitespace should not error");
    assert_eq!(embedding, vec![0.0; 64]);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_embedding_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_json(json!({
            "model": "test-model",
            "prompt": "strong liquidity"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embedding": [0.1, 0.2, 0.3]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(&test_config(&server, 3)).expect("Failed to create client");
    let embedding = client.embed("strong liquidity").expect("embed should succeed");

    assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_preserves_input_order_and_zero_fills_empty_slots() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_json(json!({
            "model": "test-model",
            "input": ["first text", "second text"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(&test_config(&server, 3)).expect("Failed to create client");
    let texts = vec![
        "first text".to_string(),
        String::new(),
        "second text".to_string(),
    ];
    let embeddings = client.embed_batch(&texts).expect("batch should succeed");

    assert_eq!(embeddings.len(), 3);
    assert_eq!(embeddings[0], vec![1.0, 0.0, 0.0]);
    assert_eq!(embeddings[1], vec![0.0, 0.0, 0.0]);
    assert_eq!(embeddings[2], vec![0.0, 1.0, 0.0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_dimension_response_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embedding": [0.1, 0.2]
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&test_config(&server, 3)).expect("Failed to create client");
    let result = client.embed("some text");

    assert!(matches!(
        result,
        Err(KbError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_error_maps_to_embedding_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&test_config(&server, 3))
        .expect("Failed to create client")
        .with_retry_attempts(1);
    let result = client.embed("some text");

    assert!(matches!(result, Err(KbError::EmbeddingUnavailable(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn validate_model_rejects_unknown_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "other-model"}]
        })))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&test_config(&server, 3)).expect("Failed to create client");
    assert!(client.ping().is_ok());
    assert!(matches!(
        client.validate_model(),
        Err(KbError::EmbeddingUnavailable(_))
    ));
}
