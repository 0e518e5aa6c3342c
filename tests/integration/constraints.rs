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
    config
}

async fn spawn_server(config: Config) -> SocketAddr {
    let engine = Arc::new(Engine::open(&config).expect("engine opens"));
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

async fn commit(addr: SocketAddr, statements: Value) -> Value {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/db/neo4j/tx/commit"))
        .json(&json!({ "statements": statements }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    response.json().await.expect("json body")
}

async fn count_label(addr: SocketAddr, label: &str) -> i64 {
    let body = commit(
        addr,
        json!([{ "statement": format!("MATCH (n:{label}) RETURN count(n) AS c") }]),
    )
    .await;
    body["results"][0]["data"][0]["row"][0]
        .as_i64()
        .expect("count")
}

#[tokio::test]
async fn unique_constraint_rejects_duplicates_across_transactions() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    let ddl = commit(
        addr,
        json!([{ "statement": "CREATE CONSTRAINT user_email FOR (n:User) REQUIRE n.email IS UNIQUE" }]),
    )
    .await;
    assert_eq!(ddl["errors"].as_array().expect("errors").len(), 0);

    let first = commit(
        addr,
        json!([{ "statement": "CREATE (:User {email: 'a@x'})" }]),
    )
    .await;
    assert_eq!(first["errors"].as_array().expect("errors").len(), 0);

    let second = commit(
        addr,
        json!([{ "statement": "CREATE (:User {email: 'a@x'})" }]),
    )
    .await;
    let errors = second["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "Neo.ClientError.Schema.ConstraintViolation");

    assert_eq!(count_label(addr, "User").await, 1);
}

#[tokio::test]
async fn node_key_requires_all_listed_properties() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([{ "statement": "CREATE CONSTRAINT user_key FOR (u:User) REQUIRE (u.username, u.domain) IS NODE KEY" }]),
    )
    .await;

    let partial = commit(
        addr,
        json!([{ "statement": "CREATE (:User {username: 'alice'})" }]),
    )
    .await;
    let errors = partial["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "Neo.ClientError.Schema.ConstraintViolation");
    assert!(errors[0]["message"]
        .as_str()
        .expect("message")
        .contains("domain"));

    let full = commit(
        addr,
        json!([{ "statement": "CREATE (:User {username: 'alice', domain: 'x'})" }]),
    )
    .await;
    assert_eq!(full["errors"].as_array().expect("errors").len(), 0);

    // The composite pair is now taken.
    let duplicate = commit(
        addr,
        json!([{ "statement": "CREATE (:User {username: 'alice', domain: 'x'})" }]),
    )
    .await;
    assert_eq!(duplicate["errors"].as_array().expect("errors").len(), 1);
    assert_eq!(count_label(addr, "User").await, 1);
}

#[tokio::test]
async fn constraint_creation_fails_on_existing_violations() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([
            { "statement": "CREATE (:Acct {code: 'dup'})" },
            { "statement": "CREATE (:Acct {code: 'dup'})" },
        ]),
    )
    .await;

    let ddl = commit(
        addr,
        json!([{ "statement": "CREATE CONSTRAINT acct_code FOR (n:Acct) REQUIRE n.code IS UNIQUE" }]),
    )
    .await;
    let errors = ddl["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "Neo.ClientError.Schema.ConstraintViolation");

    // The constraint must not be half-installed: inserts still work.
    let insert = commit(
        addr,
        json!([{ "statement": "CREATE (:Acct {code: 'dup'})" }]),
    )
    .await;
    assert_eq!(insert["errors"].as_array().expect("errors").len(), 0);
}

#[tokio::test]
async fn exists_constraint_enforces_non_null() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([{ "statement": "CREATE CONSTRAINT person_name FOR (p:Person) REQUIRE p.name IS NOT NULL" }]),
    )
    .await;

    let missing = commit(
        addr,
        json!([{ "statement": "CREATE (:Person {age: 30})" }]),
    )
    .await;
    assert_eq!(missing["errors"].as_array().expect("errors").len(), 1);

    let present = commit(
        addr,
        json!([{ "statement": "CREATE (:Person {name: 'Nora'})" }]),
    )
    .await;
    assert_eq!(present["errors"].as_array().expect("errors").len(), 0);

    // REMOVE of the protected property must fail too.
    let strip = commit(
        addr,
        json!([{ "statement": "MATCH (p:Person {name: 'Nora'}) REMOVE p.name" }]),
    )
    .await;
    assert_eq!(strip["errors"].as_array().expect("errors").len(), 1);
}

#[tokio::test]
async fn type_constraint_applies_integer_float_coercion() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([{ "statement": "CREATE CONSTRAINT age_int FOR (p:Person) REQUIRE p.age IS :: INTEGER" }]),
    )
    .await;

    // 30.0 coerces onto INTEGER; 30.5 does not.
    let coerced = commit(
        addr,
        json!([{
            "statement": "CREATE (:Person {age: $age})",
            "parameters": { "age": 30.0 },
        }]),
    )
    .await;
    assert_eq!(coerced["errors"].as_array().expect("errors").len(), 0);

    let fractional = commit(
        addr,
        json!([{
            "statement": "CREATE (:Person {age: $age})",
            "parameters": { "age": 30.5 },
        }]),
    )
    .await;
    let errors = fractional["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "Neo.ClientError.Schema.SchemaMismatch");
}

#[tokio::test]
async fn unique_survives_update_and_delete_cycles() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([{ "statement": "CREATE CONSTRAINT tag_slug FOR (t:Tag) REQUIRE t.slug IS UNIQUE" }]),
    )
    .await;
    commit(addr, json!([{ "statement": "CREATE (:Tag {slug: 'rust'})" }])).await;

    // Rename frees the old value for reuse.
    commit(
        addr,
        json!([{ "statement": "MATCH (t:Tag {slug: 'rust'}) SET t.slug = 'systems'" }]),
    )
    .await;
    let reuse = commit(addr, json!([{ "statement": "CREATE (:Tag {slug: 'rust'})" }])).await;
    assert_eq!(reuse["errors"].as_array().expect("errors").len(), 0);

    // Deleting frees it again.
    commit(
        addr,
        json!([{ "statement": "MATCH (t:Tag {slug: 'systems'}) DELETE t" }]),
    )
    .await;
    let again = commit(
        addr,
        json!([{ "statement": "CREATE (:Tag {slug: 'systems'})" }]),
    )
    .await;
    assert_eq!(again["errors"].as_array().expect("errors").len(), 0);
    assert_eq!(count_label(addr, "Tag").await, 2);
}

#[tokio::test]
async fn label_casing_resolves_to_one_label() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;

    commit(addr, json!([{ "statement": "CREATE (:User {name: 'cased'})" }])).await;
    let lower = commit(
        addr,
        json!([{ "statement": "MATCH (n:user) RETURN count(n) AS c" }]),
    )
    .await;
    assert_eq!(lower["results"][0]["data"][0]["row"], json!([1]));

    let labels = commit(addr, json!([{ "statement": "CALL db.labels()" }])).await;
    let rows = labels["results"][0]["data"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["row"], json!(["User"]));
}
