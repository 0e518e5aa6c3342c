#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use nornicdb::config::Config;
use nornicdb::engine::Engine;
use nornicdb::metrics::Metrics;
use nornicdb::server::{build_router, AppState, Authenticator, RateLimiter, TxRegistry};

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.rate_limit.enabled = false;
    config.auth.enabled = true;
    config
}

async fn spawn_server(config: Config) -> SocketAddr {
    let engine = Arc::new(Engine::open(&config).expect("engine opens"));
    engine.init_embeddings(&config).await;
    let auth = Authenticator::open(&config.auth_dir()).expect("auth store");
    let state = Arc::new(AppState {
        engine,
        auth,
        limiter: RateLimiter::new(config.rate_limit.clone()),
        metrics: Metrics::new(),
        txs: TxRegistry::new(Duration::from_secs(config.tx_timeout_secs)),
        config,
    });
    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    addr
}

async fn admin_token(addr: SocketAddr) -> String {
    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("http://{addr}/auth/token"))
        .json(&json!({ "username": "admin", "password": "admin" }))
        .send()
        .await
        .expect("token")
        .json()
        .await
        .expect("json");
    body["token"].as_str().expect("token string").to_string()
}

#[tokio::test]
async fn missing_credentials_are_unauthorized() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/db/neo4j/tx/commit"))
        .json(&json!({ "statements": [{ "statement": "MATCH (n) RETURN count(n)" }] }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.expect("json");
    assert_eq!(
        body["errors"][0]["code"],
        "Neo.ClientError.Security.Unauthorized"
    );
}

#[tokio::test]
async fn read_role_cannot_mutate() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();
    let admin = admin_token(addr).await;

    let created = client
        .post(format!("http://{addr}/auth/users"))
        .bearer_auth(&admin)
        .json(&json!({ "username": "reader", "password": "s3cret", "role": "read" }))
        .send()
        .await
        .expect("create user");
    assert_eq!(created.status(), 201);

    let token_body: Value = client
        .post(format!("http://{addr}/auth/token"))
        .json(&json!({ "username": "reader", "password": "s3cret" }))
        .send()
        .await
        .expect("login")
        .json()
        .await
        .expect("json");
    let reader = token_body["token"].as_str().expect("token").to_string();
    assert_eq!(token_body["role"], "read");

    let read = client
        .post(format!("http://{addr}/db/neo4j/tx/commit"))
        .bearer_auth(&reader)
        .json(&json!({ "statements": [{ "statement": "MATCH (n) RETURN count(n) AS c" }] }))
        .send()
        .await
        .expect("read");
    assert_eq!(read.status(), 200);

    let write = client
        .post(format!("http://{addr}/db/neo4j/tx/commit"))
        .bearer_auth(&reader)
        .json(&json!({ "statements": [{ "statement": "CREATE (:Thing)" }] }))
        .send()
        .await
        .expect("write");
    assert_eq!(write.status(), 403);
    let body: Value = write.json().await.expect("json");
    assert_eq!(
        body["errors"][0]["code"],
        "Neo.ClientError.Security.Forbidden"
    );

    // Admin surface is out of reach too.
    let stats = client
        .get(format!("http://{addr}/admin/stats"))
        .bearer_auth(&reader)
        .send()
        .await
        .expect("stats");
    assert_eq!(stats.status(), 403);
}

#[tokio::test]
async fn basic_auth_and_me_round_trip() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();

    let me: Value = client
        .get(format!("http://{addr}/auth/me"))
        .basic_auth("admin", Some("admin"))
        .send()
        .await
        .expect("me")
        .json()
        .await
        .expect("json");
    assert_eq!(me["username"], "admin");
    assert_eq!(me["role"], "admin");
    assert_eq!(me["authenticated"], true);
}

#[tokio::test]
async fn logout_invalidates_the_token() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();
    let token = admin_token(addr).await;

    let before = client
        .get(format!("http://{addr}/status"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("status");
    assert_eq!(before.status(), 200);

    let logout = client
        .post(format!("http://{addr}/auth/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("logout");
    assert_eq!(logout.status(), 204);

    let after = client
        .get(format!("http://{addr}/status"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("status");
    assert_eq!(after.status(), 401);
}

#[tokio::test]
async fn gdpr_subjects_may_only_touch_their_own_data() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();
    let admin = admin_token(addr).await;

    // Seed data for two subjects.
    let seeded = client
        .post(format!("http://{addr}/db/neo4j/tx/commit"))
        .bearer_auth(&admin)
        .json(&json!({ "statements": [
            { "statement": "CREATE (:Profile {subject_id: 'alice', name: 'Alice'})" },
            { "statement": "CREATE (:Profile {subject_id: 'bob', name: 'Bob'})" },
        ]}))
        .send()
        .await
        .expect("seed");
    assert_eq!(seeded.status(), 200);

    client
        .post(format!("http://{addr}/auth/users"))
        .bearer_auth(&admin)
        .json(&json!({ "username": "alice", "password": "pw", "role": "write" }))
        .send()
        .await
        .expect("create alice");
    let alice_token: Value = client
        .post(format!("http://{addr}/auth/token"))
        .json(&json!({ "username": "alice", "password": "pw" }))
        .send()
        .await
        .expect("login")
        .json()
        .await
        .expect("json");
    let alice = alice_token["token"].as_str().expect("token").to_string();

    // Alice exports herself but not Bob.
    let own = client
        .post(format!("http://{addr}/gdpr/export"))
        .bearer_auth(&alice)
        .json(&json!({ "subject_id": "alice" }))
        .send()
        .await
        .expect("own export");
    assert_eq!(own.status(), 200);
    let own_body: Value = own.json().await.expect("json");
    assert_eq!(own_body["nodes"].as_array().expect("nodes").len(), 1);

    let other = client
        .post(format!("http://{addr}/gdpr/export"))
        .bearer_auth(&alice)
        .json(&json!({ "subject_id": "bob" }))
        .send()
        .await
        .expect("other export");
    assert_eq!(other.status(), 403);

    // Deletion needs the confirmation phrase, then erases.
    let unconfirmed = client
        .post(format!("http://{addr}/gdpr/delete"))
        .bearer_auth(&alice)
        .json(&json!({ "subject_id": "alice" }))
        .send()
        .await
        .expect("unconfirmed");
    assert_eq!(unconfirmed.status(), 400);

    let confirmed = client
        .post(format!("http://{addr}/gdpr/delete"))
        .bearer_auth(&alice)
        .json(&json!({ "subject_id": "alice", "confirm": "DELETE" }))
        .send()
        .await
        .expect("confirmed");
    assert_eq!(confirmed.status(), 200);
    let deleted: Value = confirmed.json().await.expect("json");
    assert_eq!(deleted["deleted"], 1);
}

#[tokio::test]
async fn no_auth_mode_reports_itself() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let mut config = test_config(&dir);
    config.auth.enabled = false;
    let engine = Arc::new(Engine::open(&config).expect("engine"));
    engine.init_embeddings(&config).await;
    let state = Arc::new(AppState {
        engine,
        auth: Authenticator::disabled(),
        limiter: RateLimiter::new(config.rate_limit.clone()),
        metrics: Metrics::new(),
        txs: TxRegistry::new(Duration::from_secs(config.tx_timeout_secs)),
        config,
    });
    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    let body: Value = reqwest::Client::new()
        .post(format!("http://{addr}/auth/token"))
        .send()
        .await
        .expect("token")
        .json()
        .await
        .expect("json");
    assert_eq!(body["mode"], "no-auth");
    assert!(body["token"].is_null());
}
