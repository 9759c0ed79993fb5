use larder_storage::HttpMethod;
use larder_sync::{EngineConfig, RemoteClient, SyncError};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn setup(server: &MockServer) -> RemoteClient {
    RemoteClient::new(&EngineConfig {
        api_base_url: server.uri(),
        request_timeout_secs: 5,
        ..EngineConfig::default()
    })
    .unwrap()
}

// --- Auth ---

#[tokio::test]
async fn no_token_initially() {
    let server = MockServer::start().await;
    let client = setup(&server);
    assert!(!client.has_token().await);
}

#[tokio::test]
async fn bearer_token_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/suppliers"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = setup(&server);
    client.set_token(Some("tok-1".into())).await;
    assert!(client.has_token().await);
    assert_eq!(client.get("/api/suppliers").await.unwrap(), json!([]));
}

#[tokio::test]
async fn cleared_token_is_not_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/suppliers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = setup(&server);
    client.set_token(Some("tok-1".into())).await;
    client.set_token(None).await;
    client.get("/api/suppliers").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

// --- Requests ---

#[tokio::test]
async fn post_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/inventory"))
        .and(body_json(json!({"name": "Salt", "qty": 10})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42, "name": "Salt", "qty": 10})))
        .mount(&server)
        .await;

    let client = setup(&server);
    let body = client
        .post("/api/inventory", &json!({"name": "Salt", "qty": 10}))
        .await
        .unwrap();
    assert_eq!(body["id"], 42);
}

#[tokio::test]
async fn empty_success_body_is_null() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/inventory/42"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = setup(&server);
    assert_eq!(client.delete("/api/inventory/42").await.unwrap(), serde_json::Value::Null);
}

#[tokio::test]
async fn send_uses_recorded_method() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/recipes/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 3})))
        .expect(1)
        .mount(&server)
        .await;

    let client = setup(&server);
    let body = client
        .send(HttpMethod::Put, "/api/recipes/3", Some(&json!({"name": "Soup"})))
        .await
        .unwrap();
    assert_eq!(body["id"], 3);
}

// --- Failures ---

#[tokio::test]
async fn non_2xx_is_remote_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = setup(&server);
    let err = client.get("/api/users").await.unwrap_err();
    match err {
        SyncError::RemoteStatus { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected RemoteStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn long_error_bodies_are_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(4096)))
        .mount(&server)
        .await;

    let client = setup(&server);
    let err = client.get("/api/users").await.unwrap_err();
    let SyncError::RemoteStatus { message, .. } = err else {
        panic!("expected RemoteStatus");
    };
    assert_eq!(message.len(), 512);
}

#[tokio::test]
async fn unreachable_server() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let client = RemoteClient::new(&EngineConfig {
        api_base_url: uri,
        request_timeout_secs: 2,
        ..EngineConfig::default()
    })
    .unwrap();
    let err = client.get("/api/users").await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteUnreachable(_)));
    assert!(err.is_remote());
}
