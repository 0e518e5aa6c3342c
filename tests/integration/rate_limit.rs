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
    config.rate_limit.enabled = true;
    config.rate_limit.per_minute = 2;
    config.rate_limit.per_hour = 100;
    config.rate_limit.burst = 1;
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

#[tokio::test]
async fn third_request_in_a_burst_is_limited() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/db/neo4j/tx/commit");
    let body = json!({ "statements": [{ "statement": "MATCH (n) RETURN count(n) AS c" }] });

    let first = client.post(&url).json(&body).send().await.expect("1");
    let second = client.post(&url).json(&body).send().await.expect("2");
    let third = client.post(&url).json(&body).send().await.expect("3");
    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 200);
    assert_eq!(third.status(), 429);
    let retry_after = third
        .headers()
        .get("retry-after")
        .expect("Retry-After header")
        .to_str()
        .expect("ascii")
        .parse::<u64>()
        .expect("seconds");
    assert!(retry_after >= 1);

    let payload: Value = third.json().await.expect("json");
    assert_eq!(payload["code"], "Neo.ClientError.Request.TooManyRequests");
}

#[tokio::test]
async fn health_is_exempt_while_limited() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let addr = spawn_server(test_config(&dir)).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/db/neo4j/tx/commit");
    let body = json!({ "statements": [] });

    // Exhaust the bucket.
    for _ in 0..3 {
        let _ = client.post(&url).json(&body).send().await.expect("drain");
    }
    assert_eq!(
        client
            .post(&url)
            .json(&body)
            .send()
            .await
            .expect("limited")
            .status(),
        429
    );

    // Health keeps answering for the same source address.
    for _ in 0..5 {
        let health = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .expect("health");
        assert_eq!(health.status(), 200);
        let body: Value = health.json().await.expect("json");
        assert_eq!(body["status"], "ok");
        assert!(body["embeddings"].is_string());
    }
}
