#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tempfile::TempDir;

use nornicdb::config::{Config, EmbeddingProvider};
use nornicdb::engine::Engine;
use nornicdb::metrics::Metrics;
use nornicdb::server::{build_router, AppState, Authenticator, RateLimiter, TxRegistry};

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.rate_limit.enabled = false;
    config.embedding.dimension = 128;
    config
}

async fn spawn_server(config: Config) -> (SocketAddr, Arc<Engine>) {
    let engine = Arc::new(Engine::open(&config).expect("engine opens"));
    engine.init_embeddings(&config).await;
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&engine).run_embed_worker(shutdown_rx));
    // The sender must outlive the worker.
    std::mem::forget(_shutdown_tx);

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
    (addr, engine)
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

async fn wait_for_embeddings(engine: &Engine, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
        let embedded = nodes.iter().filter(|n| n.embedding.is_some()).count();
        if embedded >= expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "embeddings never arrived ({embedded}/{expected})"
        );
        engine.embed_queue.wake();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn search_degrades_to_lexical_when_vector_side_is_down() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let mut config = test_config(&dir);
    // A remote producer nothing listens on: the health probe fails and the
    // pipeline demotes itself.
    config.embedding.provider = EmbeddingProvider::RemoteOpenAi;
    config.embedding.url = "http://127.0.0.1:9/v1/embeddings".into();
    config.embedding.timeout_secs = 1;
    let (addr, _engine) = spawn_server(config).await;

    commit(
        addr,
        json!([
            { "statement": "CREATE (:Doc {title: 'auth', content: 'authentication handler for the api'})" },
            { "statement": "CREATE (:Doc {title: 'parser', content: 'query parser internals'})" },
        ]),
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/search"))
        .json(&json!({ "query": "authentication" }))
        .send()
        .await
        .expect("search");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["vector_unavailable"], true);
    let results = body["results"].as_array().expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0]["node"]["properties"]["title"],
        json!("auth")
    );
    assert!(results[0]["bm25_rank"].is_number());
    assert!(results[0]["vector_rank"].is_null());
}

#[tokio::test]
async fn hybrid_ranking_promotes_semantic_overlap_over_diluted_literal_match() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, engine) = spawn_server(test_config(&dir)).await;

    // One focused doc sharing query vocabulary but missing the key token,
    // one long doc containing the key token exactly once.
    let filler = "storage paging compaction metrics tracing flamegraph allocator ".repeat(30);
    commit(
        addr,
        json!([
            { "statement": "CREATE (:Doc {title: 'sessions', content: 'login session handling for signed in users with login tokens'})" },
            { "statement": format!("CREATE (:Doc {{title: 'kitchen-sink', content: 'authentication {filler}'}})") },
            { "statement": "CREATE (:Doc {title: 'unrelated', content: 'btree page split benchmarks'})" },
        ]),
    )
    .await;
    wait_for_embeddings(&engine, 3).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/search"))
        .json(&json!({ "query": "authentication login", "limit": 3 }))
        .send()
        .await
        .expect("search");
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["vector_unavailable"], false);
    let results = body["results"].as_array().expect("results");
    assert!(results.len() >= 2);
    // The focused, vocabulary-adjacent doc outranks the diluted literal hit.
    let titles: Vec<&str> = results
        .iter()
        .map(|r| r["node"]["properties"]["title"].as_str().expect("title"))
        .collect();
    let sessions_pos = titles.iter().position(|t| *t == "sessions").expect("sessions ranked");
    let sink_pos = titles.iter().position(|t| *t == "kitchen-sink").expect("sink ranked");
    assert!(sessions_pos < sink_pos, "got order {titles:?}");
    assert!(results[0]["rrf_score"].is_number());
}

#[tokio::test]
async fn similar_excludes_the_source_node() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, engine) = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([
            { "statement": "CREATE (:Note {title: 'rust', content: 'ownership borrowing lifetimes in rust'})" },
            { "statement": "CREATE (:Note {title: 'more-rust', content: 'rust lifetimes and borrowing rules'})" },
            { "statement": "CREATE (:Note {title: 'cooking', content: 'sourdough starter hydration schedule'})" },
        ]),
    )
    .await;
    wait_for_embeddings(&engine, 3).await;

    let source_id = {
        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
        nodes
            .iter()
            .find(|n| {
                n.properties.get("title")
                    == Some(&nornicdb::PropertyValue::String("rust".into()))
            })
            .expect("source")
            .id
            .clone()
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/similar"))
        .json(&json!({ "node_id": source_id, "limit": 2 }))
        .send()
        .await
        .expect("similar");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    let results = body["results"].as_array().expect("results");
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|r| r["node"]["id"].as_str().expect("id") != source_id));
    assert_eq!(
        results[0]["node"]["properties"]["title"],
        json!("more-rust")
    );
}

#[tokio::test]
async fn vector_procedure_returns_ranked_nodes() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, engine) = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([
            { "statement": "CREATE (:Doc {title: 'alpha', content: 'graph database traversal'})" },
            { "statement": "CREATE (:Doc {title: 'beta', content: 'vector embedding search'})" },
        ]),
    )
    .await;
    wait_for_embeddings(&engine, 2).await;

    let query_vector: Vec<f32> = {
        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
        nodes
            .iter()
            .find(|n| {
                n.properties.get("title")
                    == Some(&nornicdb::PropertyValue::String("beta".into()))
            })
            .expect("beta")
            .embedding
            .as_ref()
            .expect("embedding")
            .vector
            .clone()
    };

    let body = commit(
        addr,
        json!([{
            "statement": "CALL db.index.vector.queryNodes('embeddings', 2, $vec) YIELD node, score RETURN node.title AS title, score",
            "parameters": { "vec": query_vector },
        }]),
    )
    .await;
    assert_eq!(body["errors"].as_array().expect("errors").len(), 0);
    let rows = body["results"][0]["data"].as_array().expect("rows");
    assert_eq!(rows[0]["row"][0], json!("beta"));
    assert!(rows[0]["row"][1].as_f64().expect("score") > 0.99);
}

#[tokio::test]
async fn rebuild_reindexes_everything() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, _engine) = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([
            { "statement": "CREATE (:Doc {title: 'one', content: 'lexical rebuild subject'})" },
            { "statement": "CREATE (:Doc {title: 'two', content: 'another rebuild subject'})" },
        ]),
    )
    .await;

    let client = reqwest::Client::new();
    let rebuilt: Value = client
        .post(format!("http://{addr}/search/rebuild"))
        .send()
        .await
        .expect("rebuild")
        .json()
        .await
        .expect("json");
    assert_eq!(rebuilt["indexed"], 2);

    let body: Value = client
        .post(format!("http://{addr}/search"))
        .json(&json!({ "query": "rebuild" }))
        .send()
        .await
        .expect("search")
        .json()
        .await
        .expect("json");
    assert_eq!(body["results"].as_array().expect("results").len(), 2);
}

#[tokio::test]
async fn embed_trigger_and_stats_report_queue_state() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (addr, engine) = spawn_server(test_config(&dir)).await;

    commit(
        addr,
        json!([{ "statement": "CREATE (:Doc {title: 'queued', content: 'text to embed'})" }]),
    )
    .await;
    wait_for_embeddings(&engine, 1).await;

    let client = reqwest::Client::new();
    let stats: Value = client
        .get(format!("http://{addr}/embed/stats"))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("json");
    assert!(stats["processed"].as_u64().expect("processed") >= 1);

    // Regenerate clears and re-queues; the worker catches back up.
    let trigger: Value = client
        .post(format!("http://{addr}/embed/trigger?regenerate=true"))
        .send()
        .await
        .expect("trigger")
        .json()
        .await
        .expect("json");
    assert!(trigger["status"].is_string());
    wait_for_embeddings(&engine, 1).await;
}
