//! HTTP transaction surface: router, middleware, background tasks and the
//! serve loop.

pub mod auth;
pub mod extensions;
pub mod handlers;
pub mod rate_limit;
pub mod tx;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{NornicError, Result};
use crate::metrics::Metrics;

pub use auth::Authenticator;
pub use rate_limit::RateLimiter;
pub use tx::TxRegistry;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: Authenticator,
    pub limiter: RateLimiter,
    pub metrics: Metrics,
    pub txs: TxRegistry,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

/// Error wrapper for the extension endpoints: natural HTTP status plus a
/// `{code, message}` body in the Neo4j catalog.
pub struct ApiError(pub NornicError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<NornicError> for ApiError {
    fn from(err: NornicError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({
            "code": self.0.neo4j_code(),
            "message": self.0.to_string(),
        }));
        let mut response = (status, body).into_response();
        if let NornicError::RateLimited { retry_after_secs } = self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Per-request gate: rate limit (never for `/health`), request counters.
async fn guard(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() != "/health" {
        if let Err(err) = state.limiter.check(addr.ip()) {
            state.metrics.request_started();
            state.metrics.request_finished(true);
            return ApiError(err).into_response();
        }
    }
    state.metrics.request_started();
    let response = next.run(request).await;
    state
        .metrics
        .request_finished(response.status().is_client_error() || response.status().is_server_error());
    response
}

fn recovered_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".into());
    error!(detail = %detail, "request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "results": [],
            "errors": [{
                "code": "Neo.DatabaseError.General.UnknownError",
                "message": "internal error",
            }],
        })),
    )
        .into_response()
}

fn build_cors(config: &Config) -> Option<CorsLayer> {
    if !config.cors.enabled {
        return None;
    }
    let origins: Vec<HeaderValue> = config
        .cors
        .origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| HeaderValue::from_str(o.trim_end_matches('/')).ok())
        .collect();
    let wildcard = config.cors.origins.iter().any(|o| o == "*");

    let mut layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::ACCEPT,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);
    // Wildcard and credentials never combine; config validation refuses the
    // pair, and this builder enforces it regardless of the caller.
    if wildcard && !config.cors.allow_credentials {
        layer = layer.allow_origin(AllowOrigin::any());
    } else if !origins.is_empty() {
        layer = layer.allow_origin(AllowOrigin::list(origins));
        if config.cors.allow_credentials {
            layer = layer.allow_credentials(true);
        }
    } else {
        warn!("CORS enabled but no usable origins; layer disabled");
        return None;
    }
    Some(layer)
}

pub fn build_router(state: SharedState) -> Router {
    let cors = build_cors(&state.config);
    let body_limit = state.config.max_body_bytes;

    let mut router = Router::new()
        .route("/", get(handlers::discovery))
        .route("/health", get(extensions::health))
        .route("/status", get(extensions::status))
        .route("/db/:name", get(handlers::db_info))
        .route("/db/:name/tx", post(handlers::open_tx))
        .route("/db/:name/tx/commit", post(handlers::implicit_commit))
        .route(
            "/db/:name/tx/:id",
            post(handlers::append_tx).delete(handlers::rollback_tx),
        )
        .route("/db/:name/tx/:id/commit", post(handlers::commit_tx))
        .route("/search", post(extensions::search))
        .route("/search/rebuild", post(extensions::search_rebuild))
        .route("/similar", post(extensions::similar))
        .route("/embed/trigger", post(extensions::embed_trigger))
        .route("/embed/stats", get(extensions::embed_stats))
        .route("/embed/clear", post(extensions::embed_clear))
        .route("/gdpr/export", post(extensions::gdpr_export))
        .route("/gdpr/delete", post(extensions::gdpr_delete))
        .route("/admin/stats", get(extensions::admin_stats))
        .route("/admin/config", get(extensions::admin_config))
        .route("/admin/backup", post(extensions::admin_backup))
        .route("/auth/token", post(extensions::auth_token))
        .route("/auth/logout", post(extensions::auth_logout))
        .route("/auth/me", get(extensions::auth_me))
        .route(
            "/auth/users",
            get(extensions::list_users).post(extensions::create_user),
        )
        .route(
            "/auth/users/:name",
            axum::routing::put(extensions::update_user).delete(extensions::delete_user),
        )
        .route("/decay/config", get(extensions::decay_config));

    if let Some(cors) = cors {
        router = router.layer(cors);
    }
    router
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .layer(CatchPanicLayer::custom(recovered_panic))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(?err, "failed to listen for shutdown signal"),
    }
}

/// Boots the engine and serves until ctrl-c. The three background tasks
/// (WAL batch-sync ticker, embedding worker, maintenance sweeper) stop on
/// the shutdown signal, and the WAL drains before exit.
pub async fn serve(config: Config) -> Result<()> {
    let engine = Arc::new(Engine::open(&config)?);
    engine.init_embeddings(&config).await;

    let authenticator = if config.auth.enabled {
        Authenticator::open(&config.auth_dir())?
    } else {
        Authenticator::disabled()
    };
    if config.tls.cert_path.is_some() || config.tls.key_path.is_some() {
        warn!("TLS paths configured; terminate TLS at a fronting proxy, serving plaintext here");
    }

    let state: SharedState = Arc::new(AppState {
        engine: Arc::clone(&engine),
        auth: authenticator,
        limiter: RateLimiter::new(config.rate_limit.clone()),
        metrics: Metrics::new(),
        txs: TxRegistry::new(Duration::from_secs(config.tx_timeout_secs)),
        config: config.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = tokio::spawn(Arc::clone(&engine).run_embed_worker(shutdown_rx.clone()));

    let wal_ticker = {
        let engine = Arc::clone(&engine);
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_millis(config.wal.batch_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = engine.wal_sync() {
                            error!(%err, "wal batch sync failed");
                        }
                    }
                }
            }
        })
    };

    let sweeper = {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let buckets = state.limiter.sweep();
                        let txs = state.txs.sweep();
                        if buckets + txs > 0 {
                            tracing::debug!(buckets, txs, "maintenance sweep");
                        }
                    }
                }
            }
        })
    };

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        data_dir = %config.data_dir.display(),
        wal = config.wal.enabled,
        auth = config.auth.enabled,
        "nornicdb listening"
    );

    let router = build_router(Arc::clone(&state));
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    wal_ticker.abort();
    sweeper.abort();
    engine.shutdown_flush()?;
    info!("clean shutdown complete");
    Ok(())
}
