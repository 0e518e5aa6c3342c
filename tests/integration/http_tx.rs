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

async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
    let engine = Arc::new(Engine::open(&config).expect("engine opens"));
    engine.init_embeddings(&config).await;
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
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
    (addr, state)
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

#[tokio::test]
async fn implicit_create_and_match() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;

    let body = commit(
        addr,
        json!([
            { "statement": "CREATE (n:Person {email:'a@x'}) RETURN n" },
            { "statement": "MATCH (n:Person) RETURN count(n) AS c" },
        ]),
    )
    .await;

    assert_eq!(body["errors"].as_array().expect("errors").len(), 0);
    let results = body["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[1]["columns"], json!(["c"]));
    assert_eq!(results[1]["data"][0]["row"], json!([1]));
    let bookmarks = body["lastBookmarks"].as_array().expect("bookmarks");
    assert_eq!(bookmarks.len(), 1);
    assert!(bookmarks[0].as_str().expect("string").starts_with("nornic:seq-"));
}

#[tokio::test]
async fn statement_error_reports_in_envelope_and_rolls_back() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;

    let body = commit(
        addr,
        json!([
            { "statement": "CREATE (:Widget {sku: 'w-1'})" },
            { "statement": "THIS IS NOT CYPHER" },
            { "statement": "CREATE (:Widget {sku: 'w-2'})" },
        ]),
    )
    .await;

    let errors = body["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "Neo.ClientError.Statement.SyntaxError");
    // One result for the statement that ran before the failure, none after.
    assert_eq!(body["results"].as_array().expect("results").len(), 1);

    let count = commit(
        addr,
        json!([{ "statement": "MATCH (n:Widget) RETURN count(n) AS c" }]),
    )
    .await;
    assert_eq!(count["results"][0]["data"][0]["row"], json!([0]));
}

#[tokio::test]
async fn explicit_rollback_discards_writes() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();

    let open = client
        .post(format!("http://{addr}/db/neo4j/tx"))
        .json(&json!({ "statements": [{ "statement": "CREATE (:Temp)" }] }))
        .send()
        .await
        .expect("open");
    assert_eq!(open.status(), 201);
    let open_body: Value = open.json().await.expect("body");
    let commit_url = open_body["commit"].as_str().expect("commit url");
    let tx_id: u64 = commit_url
        .trim_end_matches("/commit")
        .rsplit('/')
        .next()
        .expect("segment")
        .parse()
        .expect("tx id");
    assert!(open_body["transaction"]["expires"].is_string());

    let rollback = client
        .delete(format!("http://{addr}/db/neo4j/tx/{tx_id}"))
        .send()
        .await
        .expect("rollback");
    assert_eq!(rollback.status(), 200);

    let count = commit(
        addr,
        json!([{ "statement": "MATCH (n:Temp) RETURN count(n) AS c" }]),
    )
    .await;
    assert_eq!(count["results"][0]["data"][0]["row"], json!([0]));
}

#[tokio::test]
async fn explicit_commit_is_atomically_visible() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();

    let open = client
        .post(format!("http://{addr}/db/neo4j/tx"))
        .json(&json!({ "statements": [{ "statement": "CREATE (:Batch {n: 1})" }] }))
        .send()
        .await
        .expect("open");
    let open_body: Value = open.json().await.expect("body");
    let commit_url = open_body["commit"].as_str().expect("commit url").to_string();
    let tx_id: u64 = commit_url
        .trim_end_matches("/commit")
        .rsplit('/')
        .next()
        .expect("segment")
        .parse()
        .expect("tx id");

    // Uncommitted writes are invisible to other transactions.
    let before = commit(
        addr,
        json!([{ "statement": "MATCH (n:Batch) RETURN count(n) AS c" }]),
    )
    .await;
    assert_eq!(before["results"][0]["data"][0]["row"], json!([0]));

    let append = client
        .post(format!("http://{addr}/db/neo4j/tx/{tx_id}"))
        .json(&json!({ "statements": [{ "statement": "CREATE (:Batch {n: 2})" }] }))
        .send()
        .await
        .expect("append");
    assert_eq!(append.status(), 200);

    let committed = client
        .post(format!("http://{addr}/db/neo4j/tx/{tx_id}/commit"))
        .json(&json!({ "statements": [] }))
        .send()
        .await
        .expect("commit");
    assert_eq!(committed.status(), 200);
    let commit_body: Value = committed.json().await.expect("body");
    assert_eq!(commit_body["errors"].as_array().expect("errors").len(), 0);
    assert!(commit_body["lastBookmarks"].is_array());

    // Both statements land together.
    let after = commit(
        addr,
        json!([{ "statement": "MATCH (n:Batch) RETURN count(n) AS c" }]),
    )
    .await;
    assert_eq!(after["results"][0]["data"][0]["row"], json!([2]));
}

#[tokio::test]
async fn meta_block_identifies_entities() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;

    let body = commit(
        addr,
        json!([{
            "statement": "CREATE (n:Meta {k: 1}) RETURN n, n.k",
            "includeStats": true,
        }]),
    )
    .await;

    let data = &body["results"][0]["data"][0];
    let meta = data["meta"].as_array().expect("meta");
    assert_eq!(meta[0]["type"], "node");
    assert_eq!(meta[0]["deleted"], false);
    assert!(meta[0]["elementId"].is_string());
    assert!(meta[1].is_null());

    let stats = &body["results"][0]["stats"];
    assert_eq!(stats["nodes_created"], 1);
    assert_eq!(stats["contains_updates"], true);
}

#[tokio::test]
async fn unknown_database_and_transaction_are_404() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();

    let bad_db = client
        .post(format!("http://{addr}/db/nope/tx/commit"))
        .json(&json!({ "statements": [] }))
        .send()
        .await
        .expect("request");
    assert_eq!(bad_db.status(), 404);

    let bad_tx = client
        .post(format!("http://{addr}/db/neo4j/tx/9999"))
        .json(&json!({ "statements": [] }))
        .send()
        .await
        .expect("request");
    assert_eq!(bad_tx.status(), 404);
}

#[tokio::test]
async fn parameters_round_trip() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;

    let body = commit(
        addr,
        json!([
            {
                "statement": "CREATE (n:Conf {name: $name, year: $year}) RETURN n.year AS y",
                "parameters": { "name": "rustconf", "year": 2026 },
            },
            {
                "statement": "MATCH (n:Conf {name: $name}) RETURN n.name AS name",
                "parameters": { "name": "rustconf" },
            },
        ]),
    )
    .await;

    assert_eq!(body["errors"].as_array().expect("errors").len(), 0);
    assert_eq!(body["results"][0]["data"][0]["row"], json!([2026]));
    assert_eq!(body["results"][1]["data"][0]["row"], json!(["rustconf"]));
}

#[tokio::test]
async fn return_distinct_deduplicates_rows() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;

    let body = commit(
        addr,
        json!([
            { "statement": "CREATE (:Person {city: 'Oslo'})" },
            { "statement": "CREATE (:Person {city: 'Oslo'})" },
            { "statement": "CREATE (:Person {city: 'Bergen'})" },
            { "statement": "MATCH (n:Person) RETURN DISTINCT n.city AS city" },
            { "statement": "MATCH (n:Person) RETURN n.city AS city" },
            { "statement": "MATCH (n:Person) RETURN DISTINCT n" },
        ]),
    )
    .await;

    assert_eq!(body["errors"].as_array().expect("errors").len(), 0);
    let results = body["results"].as_array().expect("results");
    // Scalar projection collapses the duplicate city, plain RETURN keeps it.
    let distinct_rows = results[3]["data"].as_array().expect("distinct rows");
    assert_eq!(distinct_rows.len(), 2);
    let mut cities: Vec<&str> = distinct_rows
        .iter()
        .map(|r| r["row"][0].as_str().expect("city"))
        .collect();
    cities.sort_unstable();
    assert_eq!(cities, vec!["Bergen", "Oslo"]);
    assert_eq!(results[4]["data"].as_array().expect("plain rows").len(), 3);
    // Entities deduplicate by identity: equal properties, three nodes.
    assert_eq!(results[5]["data"].as_array().expect("node rows").len(), 3);
}

#[tokio::test]
async fn discovery_document_advertises_transactions() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _state) = spawn_server(test_config(&dir)).await;

    let body: Value = reqwest::get(format!("http://{addr}/"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert!(body["transaction"].as_str().expect("url").contains("/db/"));
    assert!(body["neo4j_version"].is_string());
    assert!(body["nornicdb"]["features"]
        .as_array()
        .expect("features")
        .iter()
        .any(|f| f == "hybrid_search"));
}
