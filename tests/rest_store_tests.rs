use admission::clock::ManualClock;
use admission::error::AdmissionError;
use admission::rate_limit::{AdmissionService, DecisionSource, RateLimitPolicy};
use admission::store::{RestStore, Store, WindowRequest};
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{body_json, header, method},
    Mock, MockServer, Request, ResponseTemplate,
};

fn store(server: &MockServer, timeout: Duration) -> RestStore {
    RestStore::new(&server.uri(), Secret::new("test-token".to_string()), timeout).unwrap()
}

fn command_name(request: &Request) -> Option<String> {
    let args: Vec<String> = serde_json::from_slice(&request.body).ok()?;
    args.into_iter().next()
}

#[tokio::test]
async fn test_get_sends_bearer_token_and_reads_result() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!(["GET", "greeting"])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "hello" })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    assert_eq!(store.get("greeting").await.unwrap().as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_missing_key_is_none() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    assert!(store.get("absent").await.unwrap().is_none());
}

#[tokio::test]
async fn test_set_with_ttl_sends_px() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_json(json!(["SET", "k", "v", "PX", "5000"])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "OK" })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    store
        .set("k", "v", Some(Duration::from_secs(5)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    let err = store.ping().await.unwrap_err();
    assert!(matches!(err, AdmissionError::StoreUnavailable(_)));
}

#[tokio::test]
async fn test_rejected_token_is_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, AdmissionError::StoreUnavailable(_)));
}

#[tokio::test]
async fn test_command_error_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "WRONGTYPE Operation against a key holding the wrong kind of value"
        })))
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    match store.get("k").await {
        Err(AdmissionError::Store(message)) => assert!(message.starts_with("WRONGTYPE")),
        other => panic!("expected a store error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_json_reply_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    let err = store.get("k").await.unwrap_err();
    assert!(matches!(err, AdmissionError::MalformedReply(_)));
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "result": "PONG" }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_millis(50));
    let err = store.ping().await.unwrap_err();
    assert!(matches!(err, AdmissionError::StoreTimeout(_)));
}

#[tokio::test]
async fn test_keys_follows_scan_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(|request: &Request| {
            serde_json::from_slice::<Vec<String>>(&request.body)
                .map(|args| args.get(1).map(String::as_str) == Some("0"))
                .unwrap_or(false)
        })
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "result": ["17", ["ns:a"]] })),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(|request: &Request| {
            serde_json::from_slice::<Vec<String>>(&request.body)
                .map(|args| args.get(1).map(String::as_str) == Some("17"))
                .unwrap_or(false)
        })
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "result": ["0", ["ns:b", "ns:c"]] })),
        )
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    let keys = store.keys("ns:*").await.unwrap();
    assert_eq!(keys, vec!["ns:a", "ns:b", "ns:c"]);
}

#[tokio::test]
async fn test_record_hit_runs_window_script() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(|request: &Request| command_name(request).as_deref() == Some("EVAL"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [2, 1, 1000] })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    let hit = store
        .record_hit("rl:k", &WindowRequest::new(5_000, 60_000, 3))
        .await
        .unwrap();

    assert_eq!(hit.count, 2);
    assert!(hit.recorded);
    assert_eq!(hit.oldest_ms, Some(1_000));

    let requests = server.received_requests().await.unwrap();
    let args: Vec<Value> = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(args[2], "1");
    assert_eq!(args[3], "rl:k");
    assert_eq!(args[4], "5000");
    assert_eq!(args[5], "60000");
    assert_eq!(args[6], "3");
}

#[tokio::test]
async fn test_unexpected_script_reply_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "OK" })))
        .mount(&server)
        .await;

    let store = store(&server, Duration::from_secs(1));
    let err = store
        .record_hit("rl:k", &WindowRequest::new(0, 1_000, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::MalformedReply(_)));
}

#[tokio::test]
async fn test_service_uses_rest_store_then_falls_back() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [0, 1, -1] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let clock = ManualClock::new(0);
    let service = AdmissionService::new(
        Arc::new(store(&server, Duration::from_secs(1))),
        Arc::new(clock),
        "rl",
    );
    let policy = RateLimitPolicy::new("search", 30, 60).unwrap();

    let first = service.check(&policy, "ip:1.1.1.1").await;
    assert!(first.allowed);
    assert_eq!(first.source, DecisionSource::Distributed);
    assert_eq!(first.remaining, 29);

    let second = service.check(&policy, "ip:1.1.1.1").await;
    assert!(second.allowed);
    assert_eq!(second.source, DecisionSource::Local);
}
