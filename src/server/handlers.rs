//! Discovery, database info and the transaction endpoints.

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::cypher::{self, StatementKind};
use crate::error::{NornicError, Result};
use crate::model::{properties_from_wire, PropertyValue};
use crate::server::auth::{AuthContext, Role};
use crate::server::wire::{
    result_block, ResultBlock, StatementsBody, TxInfo, TxResponse, WireError,
};
use crate::server::SharedState;
use crate::storage::graph::Workspace;

pub const DATABASE_NAME: &str = "neo4j";

fn check_database(name: &str) -> Result<()> {
    if name == DATABASE_NAME {
        Ok(())
    } else {
        Err(NornicError::not_found("database", name))
    }
}

fn envelope(status: StatusCode, body: TxResponse) -> Response {
    (status, Json(body)).into_response()
}

fn error_envelope(err: &NornicError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    envelope(status, TxResponse::error(err))
}

/// `GET /`: service discovery document.
pub async fn discovery(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let base = format!("http://{}:{}", state.config.bind, state.config.port);
    Json(json!({
        "bolt_direct": format!("bolt://{}:7687", state.config.bind),
        "bolt_routing": format!("neo4j://{}:7687", state.config.bind),
        "transaction": format!("{base}/db/{{databaseName}}/tx"),
        "neo4j_version": "5.15.0",
        "neo4j_edition": "community",
        "nornicdb": {
            "features": [
                "vector_search",
                "hybrid_search",
                "auto_embedding",
                "bm25_fulltext",
                "constraints",
                "wal_recovery",
            ],
        },
    }))
}

/// `GET /db/{name}`: database status and entity counts.
pub async fn db_info(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = check_database(&name) {
        return error_envelope(&err);
    }
    let ctx = match state.auth.authenticate(&headers) {
        Ok(ctx) => ctx,
        Err(err) => return error_envelope(&err),
    };
    if let Err(err) = ctx.require(Role::Read) {
        return error_envelope(&err);
    }
    let (nodes, edges) = state.engine.counts();
    let labels = state.engine.catalog().labels();
    Json(json!({
        "name": name,
        "status": "online",
        "nodes": nodes,
        "relationships": edges,
        "labels": labels.len(),
        "lastSequence": state.engine.last_seq(),
    }))
    .into_response()
}

/// Body decoding: an absent body is an empty batch; malformed JSON is the
/// Neo4j invalid-format error.
fn decode_body(
    body: std::result::Result<Json<StatementsBody>, JsonRejection>,
) -> Result<StatementsBody> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(StatementsBody::default()),
        Err(rejection) => Err(NornicError::InvalidRequest(rejection.body_text())),
    }
}

fn decode_params(
    raw: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Result<BTreeMap<String, PropertyValue>> {
    match raw {
        Some(map) => {
            let props = properties_from_wire(map)
                .map_err(|e| NornicError::InvalidRequest(format!("parameters: {e}")))?;
            Ok(props.into_iter().collect())
        }
        None => Ok(BTreeMap::new()),
    }
}

fn role_for(kind: StatementKind) -> Role {
    match kind {
        StatementKind::Read => Role::Read,
        StatementKind::Write => Role::Write,
        StatementKind::Admin => Role::Admin,
    }
}

/// Authorization runs before any statement executes: the request fails
/// wholesale if one statement exceeds the caller's role.
fn authorize_batch(ctx: &AuthContext, body: &StatementsBody) -> Result<()> {
    for req in &body.statements {
        if let Ok(statement) = cypher::parse(&req.statement) {
            ctx.require(role_for(statement.kind()))?;
        }
        // Unparseable statements surface as per-statement syntax errors
        // during execution instead.
    }
    Ok(())
}

/// Runs statements in order against the workspace. The first failure stops
/// the batch; its error lands in the `errors` array and the workspace is
/// left as of the end of the last successful statement.
fn run_statements(
    state: &SharedState,
    ws: &mut Workspace,
    body: &StatementsBody,
) -> (Vec<ResultBlock>, Vec<WireError>) {
    let mut results = Vec::with_capacity(body.statements.len());
    let mut errors = Vec::new();
    for req in &body.statements {
        let params = match decode_params(req.parameters.as_ref()) {
            Ok(params) => params,
            Err(err) => {
                errors.push(WireError::from(&err));
                break;
            }
        };
        match state.engine.execute_statement(ws, &req.statement, params) {
            Ok(result) => {
                results.push(result_block(
                    &result.outcome,
                    &result.stats,
                    req.include_stats,
                    req.wants_graph(),
                ));
            }
            Err(err) => {
                debug!(statement = %req.statement, %err, "statement failed");
                errors.push(WireError::from(&err));
                break;
            }
        }
    }
    (results, errors)
}

/// `POST /db/{name}/tx/commit`: implicit transaction. Statement failures
/// report inside the envelope with HTTP 200 and roll the whole request back.
pub async fn implicit_commit(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: std::result::Result<Json<StatementsBody>, JsonRejection>,
) -> Response {
    if let Err(err) = check_database(&name) {
        return error_envelope(&err);
    }
    let ctx = match state.auth.authenticate(&headers) {
        Ok(ctx) => ctx,
        Err(err) => return error_envelope(&err),
    };
    let body = match decode_body(body) {
        Ok(body) => body,
        Err(err) => return error_envelope(&err),
    };
    if let Err(err) = authorize_batch(&ctx, &body) {
        return error_envelope(&err);
    }

    let mut ws = state.engine.begin_workspace();
    let (results, mut errors) = run_statements(&state, &mut ws, &body);
    if errors.is_empty() {
        if let Err(err) = state.engine.commit_workspace(ws) {
            errors.push(WireError::from(&err));
        }
    }
    let mut response = TxResponse::new();
    response.results = results;
    response.errors = errors;
    response.last_bookmarks = Some(vec![state.engine.bookmark()]);
    envelope(StatusCode::OK, response)
}

fn commit_url(state: &SharedState, name: &str, id: u64) -> String {
    format!(
        "http://{}:{}/db/{}/tx/{}/commit",
        state.config.bind, state.config.port, name, id
    )
}

/// `POST /db/{name}/tx`: open an explicit transaction, optionally running
/// initial statements. 201 with the commit URL and expiry.
pub async fn open_tx(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: std::result::Result<Json<StatementsBody>, JsonRejection>,
) -> Response {
    if let Err(err) = check_database(&name) {
        return error_envelope(&err);
    }
    let ctx = match state.auth.authenticate(&headers) {
        Ok(ctx) => ctx,
        Err(err) => return error_envelope(&err),
    };
    let body = match decode_body(body) {
        Ok(body) => body,
        Err(err) => return error_envelope(&err),
    };
    if let Err(err) = authorize_batch(&ctx, &body) {
        return error_envelope(&err);
    }

    let mut ws = state.engine.begin_workspace();
    let (results, errors) = run_statements(&state, &mut ws, &body);
    let (id, expires) = state.txs.open(ws);

    let mut response = TxResponse::new();
    response.results = results;
    response.errors = errors;
    response.commit = Some(commit_url(&state, &name, id));
    response.transaction = Some(TxInfo { expires });
    envelope(StatusCode::CREATED, response)
}

/// `POST /db/{name}/tx/{id}`: append statements to an open transaction.
/// A failed statement leaves the transaction active.
pub async fn append_tx(
    State(state): State<SharedState>,
    Path((name, id)): Path<(String, u64)>,
    headers: HeaderMap,
    body: std::result::Result<Json<StatementsBody>, JsonRejection>,
) -> Response {
    if let Err(err) = check_database(&name) {
        return error_envelope(&err);
    }
    let ctx = match state.auth.authenticate(&headers) {
        Ok(ctx) => ctx,
        Err(err) => return error_envelope(&err),
    };
    let body = match decode_body(body) {
        Ok(body) => body,
        Err(err) => return error_envelope(&err),
    };
    if let Err(err) = authorize_batch(&ctx, &body) {
        return error_envelope(&err);
    }

    let mut ws = match state.txs.take(id) {
        Ok(ws) => ws,
        Err(err) => return error_envelope(&err),
    };
    let (results, errors) = run_statements(&state, &mut ws, &body);
    let expires = state.txs.put_back(id, ws);

    let mut response = TxResponse::new();
    response.results = results;
    response.errors = errors;
    response.commit = Some(commit_url(&state, &name, id));
    response.transaction = Some(TxInfo { expires });
    envelope(StatusCode::OK, response)
}

/// `POST /db/{name}/tx/{id}/commit`: final statements, then commit. A
/// statement failure aborts the commit and leaves the transaction active.
pub async fn commit_tx(
    State(state): State<SharedState>,
    Path((name, id)): Path<(String, u64)>,
    headers: HeaderMap,
    body: std::result::Result<Json<StatementsBody>, JsonRejection>,
) -> Response {
    if let Err(err) = check_database(&name) {
        return error_envelope(&err);
    }
    let ctx = match state.auth.authenticate(&headers) {
        Ok(ctx) => ctx,
        Err(err) => return error_envelope(&err),
    };
    let body = match decode_body(body) {
        Ok(body) => body,
        Err(err) => return error_envelope(&err),
    };
    if let Err(err) = authorize_batch(&ctx, &body) {
        return error_envelope(&err);
    }

    let mut ws = match state.txs.take(id) {
        Ok(ws) => ws,
        Err(err) => return error_envelope(&err),
    };
    let (results, mut errors) = run_statements(&state, &mut ws, &body);
    let mut committed = false;
    if errors.is_empty() {
        match state.engine.commit_workspace(ws) {
            Ok(_) => committed = true,
            Err(err) => {
                errors.push(WireError::from(&err));
                // Commit conflicts are terminal for the transaction.
            }
        }
    } else {
        state.txs.put_back(id, ws);
    }

    let mut response = TxResponse::new();
    response.results = results;
    response.errors = errors;
    if committed {
        response.last_bookmarks = Some(vec![state.engine.bookmark()]);
    }
    envelope(StatusCode::OK, response)
}

/// `DELETE /db/{name}/tx/{id}`: rollback; nothing since open applies.
pub async fn rollback_tx(
    State(state): State<SharedState>,
    Path((name, id)): Path<(String, u64)>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = check_database(&name) {
        return error_envelope(&err);
    }
    if let Err(err) = state.auth.authenticate(&headers) {
        return error_envelope(&err);
    }
    match state.txs.rollback(id) {
        Ok(()) => envelope(StatusCode::OK, TxResponse::new()),
        Err(err) => error_envelope(&err),
    }
}
