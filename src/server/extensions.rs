//! Extension endpoints: search, embedding control, GDPR, admin and auth.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::audit;
use crate::error::NornicError;
use crate::model::PropertyValue;
use crate::server::auth::Role;
use crate::server::{ApiError, ApiResult, SharedState};

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MAX_SEARCH_LIMIT: usize = 200;

// ---- search ----

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub limit: Option<usize>,
}

/// `POST /search`: hybrid retrieval, degrading to lexical-only when the
/// vector side is out.
pub async fn search(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Read)?;
    if body.query.trim().is_empty() {
        return Err(ApiError(NornicError::InvalidRequest("empty query".into())));
    }
    let limit = body
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    let (hits, vector_unavailable) = state.engine.search(&body.query, &body.labels, limit).await?;
    let results: Vec<serde_json::Value> = hits
        .into_iter()
        .map(|(hit, node)| {
            json!({
                "node": node.to_wire(),
                "score": hit.score,
                "rrf_score": hit.rrf_score,
                "bm25_rank": hit.bm25_rank,
                "vector_rank": hit.vector_rank,
            })
        })
        .collect();
    Ok(Json(json!({
        "results": results,
        "vector_unavailable": vector_unavailable,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SimilarBody {
    pub node_id: String,
    pub limit: Option<usize>,
}

/// `POST /similar`: vector neighbors of a stored node.
pub async fn similar(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<SimilarBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Read)?;
    let limit = body
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    let neighbors = state.engine.similar(&body.node_id, limit)?;
    let results: Vec<serde_json::Value> = neighbors
        .into_iter()
        .map(|(node, score)| json!({ "node": node.to_wire(), "score": score }))
        .collect();
    Ok(Json(json!({ "results": results })))
}

/// `POST /search/rebuild`: admin; rebuilds the lexical index from scratch.
pub async fn search_rebuild(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    let indexed = state.engine.rebuild_fulltext()?;
    audit::admin_mutation(&ctx.username, "search_rebuild", &format!("{indexed} documents"));
    Ok(Json(json!({ "indexed": indexed })))
}

// ---- embedding control ----

#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    #[serde(default)]
    pub regenerate: bool,
}

/// `POST /embed/trigger?regenerate=`: wake the worker; with regenerate,
/// clear embeddings first. Returns the queue snapshot.
pub async fn embed_trigger(
    State(state): State<SharedState>,
    Query(params): Query<TriggerParams>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Write)?;
    let stats = state.engine.trigger_embedding(params.regenerate)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

/// `GET /embed/stats`: queue counters.
pub async fn embed_stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Read)?;
    let stats = state.engine.embed_queue.stats();
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

/// `POST /embed/clear`: admin; clears all embeddings.
pub async fn embed_clear(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    let cleared = state.engine.clear_embeddings()?;
    audit::admin_mutation(&ctx.username, "embed_clear", &format!("{cleared} nodes"));
    Ok(Json(json!({ "cleared": cleared })))
}

// ---- GDPR ----

#[derive(Debug, Deserialize)]
pub struct GdprBody {
    pub subject_id: String,
    #[serde(default)]
    pub confirm: Option<String>,
}

fn subject_nodes(
    state: &SharedState,
    subject_id: &str,
) -> crate::error::Result<Vec<crate::model::Node>> {
    let view = state.engine.view();
    let (all, _) = view.all_nodes(None, usize::MAX)?;
    Ok(all
        .into_iter()
        .filter(|node| {
            node.properties.get("subject_id")
                == Some(&PropertyValue::String(subject_id.to_string()))
        })
        .collect())
}

/// `POST /gdpr/export`: everything stored about one subject. Non-admins
/// may only export themselves.
pub async fn gdpr_export(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<GdprBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Read)?;
    if !ctx.is_admin() && ctx.username != body.subject_id {
        return Err(ApiError(NornicError::Forbidden(
            "subjects may only export their own data".into(),
        )));
    }
    let nodes = subject_nodes(&state, &body.subject_id)?;
    let view = state.engine.view();
    let mut edges = Vec::new();
    for node in &nodes {
        for eid in view.incident_edge_ids(&node.id) {
            if let Some(edge) = view.try_get_edge(&eid)? {
                edges.push(json!({
                    "id": edge.id,
                    "type": edge.edge_type,
                    "start": edge.start,
                    "end": edge.end,
                }));
            }
        }
    }
    audit::gdpr_operation("export", &body.subject_id, &ctx.username, nodes.len());
    Ok(Json(json!({
        "subject_id": body.subject_id,
        "nodes": nodes.iter().map(|n| n.to_wire()).collect::<Vec<_>>(),
        "relationships": edges,
    })))
}

/// `POST /gdpr/delete`: detach-deletes a subject's nodes. Requires the
/// literal confirmation string.
pub async fn gdpr_delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<GdprBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Write)?;
    if !ctx.is_admin() && ctx.username != body.subject_id {
        return Err(ApiError(NornicError::Forbidden(
            "subjects may only erase their own data".into(),
        )));
    }
    if body.confirm.as_deref() != Some("DELETE") {
        return Err(ApiError(NornicError::InvalidRequest(
            "erasure requires confirm: \"DELETE\"".into(),
        )));
    }
    let nodes = subject_nodes(&state, &body.subject_id)?;
    let mut ws = state.engine.begin_workspace();
    for node in &nodes {
        ws.delete_node(
            state.engine.catalog(),
            state.engine.fulltext_config(),
            &node.id,
            true,
        )?;
    }
    state.engine.commit_workspace(ws)?;
    audit::gdpr_operation("delete", &body.subject_id, &ctx.username, nodes.len());
    Ok(Json(json!({ "deleted": nodes.len() })))
}

// ---- admin ----

/// `GET /admin/stats`: the full counter projection.
pub async fn admin_stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    Ok(Json(full_stats(&state)))
}

fn full_stats(state: &SharedState) -> serde_json::Value {
    let (nodes, edges) = state.engine.counts();
    let embed = state.engine.embed_queue.stats();
    let (cache_hits, cache_misses) = state
        .engine
        .embedder()
        .map(|e| (e.hit_count(), e.miss_count()))
        .unwrap_or((0, 0));
    json!({
        "requests_total": state.metrics.requests_total(),
        "errors_total": state.metrics.errors_total(),
        "in_flight": state.metrics.in_flight(),
        "uptime_secs": state.metrics.uptime_secs(),
        "wal_sequence": state.engine.last_seq(),
        "nodes": nodes,
        "relationships": edges,
        "open_transactions": state.txs.open_count(),
        "rate_limited_addresses": state.limiter.tracked_addresses(),
        "embeddings": {
            "status": embed.status,
            "queued": embed.queued,
            "processed": embed.processed,
            "failed": embed.failed,
            "cache_hits": cache_hits,
            "cache_misses": cache_misses,
        },
    })
}

/// `GET /admin/config`: the effective configuration.
pub async fn admin_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    Ok(Json(
        serde_json::to_value(&state.config).unwrap_or_default(),
    ))
}

/// `POST /admin/backup`: checkpoint and report the snapshot.
pub async fn admin_backup(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    let info = state.engine.checkpoint()?;
    audit::admin_mutation(&ctx.username, "backup", &format!("base_seq {}", info.base_seq));
    Ok(Json(json!({
        "base_seq": info.base_seq,
        "nodes": info.nodes,
        "relationships": info.edges,
    })))
}

// ---- auth surface ----

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub username: String,
    pub password: String,
}

/// `POST /auth/token`: password login; opaque bearer token, or a no-auth
/// notice when authentication is off.
pub async fn auth_token(
    State(state): State<SharedState>,
    body: Option<Json<TokenBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.auth.enabled() {
        return Ok(Json(json!({ "mode": "no-auth", "token": null })));
    }
    let Some(Json(body)) = body else {
        return Err(ApiError(NornicError::InvalidRequest(
            "username and password required".into(),
        )));
    };
    let (token, role) = state.auth.login(&body.username, &body.password)?;
    Ok(Json(json!({
        "token": token,
        "role": role.name(),
    })))
}

/// `POST /auth/logout`.
pub async fn auth_logout(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    state.auth.logout(&headers);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /auth/me`.
pub async fn auth_me(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    Ok(Json(json!({
        "username": ctx.username,
        "role": ctx.role.name(),
        "authenticated": ctx.authenticated,
        "auth_enabled": ctx.enforced,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub username: String,
    pub password: String,
    pub role: String,
}

/// `POST /auth/users`: admin.
pub async fn create_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> ApiResult<StatusCode> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    let role = Role::parse(&body.role)
        .ok_or_else(|| ApiError(NornicError::InvalidRequest("unknown role".into())))?;
    state.auth.create_user(&body.username, &body.password, role)?;
    audit::admin_mutation(&ctx.username, "create_user", &body.username);
    Ok(StatusCode::CREATED)
}

/// `GET /auth/users`: admin.
pub async fn list_users(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    let users: Vec<serde_json::Value> = state
        .auth
        .list_users()
        .into_iter()
        .map(|(username, role)| json!({ "username": username, "role": role.name() }))
        .collect();
    Ok(Json(json!({ "users": users })))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserBody {
    pub password: Option<String>,
    pub role: Option<String>,
}

/// `PUT /auth/users/{name}`: admin.
pub async fn update_user(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateUserBody>,
) -> ApiResult<StatusCode> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    let role = match &body.role {
        Some(r) => Some(
            Role::parse(r)
                .ok_or_else(|| ApiError(NornicError::InvalidRequest("unknown role".into())))?,
        ),
        None => None,
    };
    state.auth.update_user(&name, body.password.as_deref(), role)?;
    audit::admin_mutation(&ctx.username, "update_user", &name);
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /auth/users/{name}`: admin.
pub async fn delete_user(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Admin)?;
    state.auth.delete_user(&name)?;
    audit::admin_mutation(&ctx.username, "delete_user", &name);
    Ok(StatusCode::NO_CONTENT)
}

// ---- health / status / decay ----

/// `GET /health`: unauthenticated, never rate limited, minimal body.
pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "time": crate::model::millis_to_rfc3339(crate::model::now_millis()),
        "embeddings": state.engine.embed_queue.stats().status,
    }))
}

/// `GET /status`: authenticated counter projection.
pub async fn status(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Read)?;
    Ok(Json(full_stats(&state)))
}

/// `GET /decay/config`: static memory-decay configuration; scoring is not
/// applied by the engine.
pub async fn decay_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let ctx = state.auth.authenticate(&headers)?;
    ctx.require(Role::Read)?;
    Ok(Json(json!({
        "enabled": false,
        "half_life_days": 30,
        "floor": 0.1,
        "weights": { "recency": 0.6, "frequency": 0.4 },
    })))
}
