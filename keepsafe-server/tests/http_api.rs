//! HTTP auth surface tests against a real listener.

use keepsafe_core::TokenAuthority;
use keepsafe_server::config::ServerConfig;
use keepsafe_server::server::{build_router, AppState};
use keepsafe_server::storage::Storage;
use serde_json::json;

async fn spawn_server() -> (String, TokenAuthority) {
    let storage = Storage::in_memory().expect("in-memory storage");
    let tokens = TokenAuthority::new("test-secret", 3600);
    let app = build_router(
        AppState {
            storage,
            tokens: tokens.clone(),
        },
        &ServerConfig::default(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (format!("http://{addr}"), tokens)
}

#[tokio::test]
async fn register_then_login_yields_a_valid_token() {
    let (base, tokens) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/register"))
        .json(&json!({"username": "alice", "password": "hunter22"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("registered"));

    let resp = client
        .post(format!("{base}/login"))
        .json(&json!({"username": "alice", "password": "hunter22"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();

    let token = body["token"].as_str().unwrap();
    let user_id = body["user_id"].as_str().unwrap();
    let claims = tokens.verify(token).expect("token verifies");
    assert_eq!(claims.user_id, user_id);
    assert_eq!(claims.username, "alice");
}

#[tokio::test]
async fn duplicate_username_is_a_conflict() {
    let (base, _) = spawn_server().await;
    let client = reqwest::Client::new();

    for expected in [201, 409] {
        let resp = client
            .post(format!("{base}/register"))
            .json(&json!({"username": "bob", "password": "pw"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), expected);
    }
}

#[tokio::test]
async fn missing_fields_are_a_bad_request() {
    let (base, _) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/register"))
        .json(&json!({"username": "carol"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{base}/login"))
        .json(&json!({"password": "pw"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn unknown_user_and_bad_password_are_distinguished() {
    let (base, _) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/login"))
        .json(&json!({"username": "ghost", "password": "pw"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    client
        .post(format!("{base}/register"))
        .json(&json!({"username": "dave", "password": "right"}))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{base}/login"))
        .json(&json!({"username": "dave", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn health_endpoint_responds() {
    let (base, _) = spawn_server().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}
