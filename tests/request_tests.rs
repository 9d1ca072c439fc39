mod common;

use std::sync::Arc;

use common::{FixedClock, MODERN_TOKEN_PATH, request_client, seed_valid_token, token_body};
use serde_json::json;
use vicare_bridge::{Error, MemoryStore};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn unauthorized_triggers_one_refresh_and_one_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/probe"))
        .and(header("authorization", "Bearer cached-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/probe"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(MODERN_TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh")))
        .expect(1)
        .mount(&server)
        .await;

    let clock = FixedClock::monday_ten();
    let store = Arc::new(MemoryStore::new());
    seed_valid_token(&store, clock.as_ref());
    let client = request_client(&server, store, clock);

    let resp = client.get("/probe").await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.json, Some(json!({"ok": true})));
}

#[tokio::test]
async fn second_unauthorized_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/probe"))
        .respond_with(ResponseTemplate::new(401).set_body_string("still no"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(MODERN_TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh")))
        .expect(1)
        .mount(&server)
        .await;

    let clock = FixedClock::monday_ten();
    let store = Arc::new(MemoryStore::new());
    seed_valid_token(&store, clock.as_ref());
    let client = request_client(&server, store, clock);

    let resp = client.get("/probe").await.unwrap();
    assert_eq!(resp.status, 401);
    let err = resp.error_for_status().unwrap_err();
    assert!(matches!(err, Error::HttpStatus { status: 401, .. }), "{err:?}");
}

#[tokio::test]
async fn non_json_body_parses_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/text"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let clock = FixedClock::monday_ten();
    let store = Arc::new(MemoryStore::new());
    seed_valid_token(&store, clock.as_ref());
    let client = request_client(&server, store, clock);

    let resp = client.get("/text").await.unwrap();
    assert!(resp.is_success());
    assert!(resp.json.is_none());
    assert_eq!(resp.body, "<html>maintenance</html>");
}

#[tokio::test]
async fn post_sends_json_body_with_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cmd"))
        .and(header("authorization", "Bearer cached-token"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"mode": "standby"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let clock = FixedClock::monday_ten();
    let store = Arc::new(MemoryStore::new());
    seed_valid_token(&store, clock.as_ref());
    let client = request_client(&server, store, clock);

    let resp = client.post("/cmd", &json!({"mode": "standby"})).await.unwrap();
    assert_eq!(resp.status, 202);
    assert!(resp.json.is_none());
}

#[tokio::test]
async fn http_status_error_truncates_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(1000)))
        .mount(&server)
        .await;

    let clock = FixedClock::monday_ten();
    let store = Arc::new(MemoryStore::new());
    seed_valid_token(&store, clock.as_ref());
    let client = request_client(&server, store, clock);

    match client.get("/big").await.unwrap().error_for_status() {
        Err(Error::HttpStatus { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body.len(), 400);
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}
