//! Neo4j HTTP wire shapes for the transaction endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::cypher::CypherValue;
use crate::cypher::executor::ExecOutcome;
use crate::error::NornicError;
use crate::storage::graph::WriteStats;

#[derive(Debug, Default, Deserialize)]
pub struct StatementsBody {
    #[serde(default)]
    pub statements: Vec<StatementReq>,
}

#[derive(Debug, Deserialize)]
pub struct StatementReq {
    pub statement: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Map<String, Json>>,
    #[serde(default, rename = "resultDataContents")]
    pub result_data_contents: Option<Vec<String>>,
    #[serde(default, rename = "includeStats")]
    pub include_stats: bool,
}

impl StatementReq {
    pub fn wants_graph(&self) -> bool {
        self.result_data_contents
            .as_ref()
            .map(|c| c.iter().any(|v| v.eq_ignore_ascii_case("graph")))
            .unwrap_or(false)
    }
}

#[derive(Debug, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&NornicError> for WireError {
    fn from(err: &NornicError) -> Self {
        WireError {
            code: err.neo4j_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WireStats {
    pub contains_updates: bool,
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub properties_set: u64,
    pub relationships_created: u64,
    pub relationship_deleted: u64,
    pub labels_added: u64,
    pub constraints_added: u64,
}

impl From<&WriteStats> for WireStats {
    fn from(stats: &WriteStats) -> Self {
        WireStats {
            contains_updates: stats.contains_updates(),
            nodes_created: stats.nodes_created,
            nodes_deleted: stats.nodes_deleted,
            properties_set: stats.properties_set,
            relationships_created: stats.relationships_created,
            relationship_deleted: stats.relationships_deleted,
            labels_added: stats.labels_added,
            constraints_added: stats.constraints_added,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DataRow {
    pub row: Vec<Json>,
    pub meta: Vec<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<Json>,
}

#[derive(Debug, Serialize)]
pub struct ResultBlock {
    pub columns: Vec<String>,
    pub data: Vec<DataRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<WireStats>,
}

#[derive(Debug, Serialize)]
pub struct TxInfo {
    pub expires: String,
}

#[derive(Debug, Serialize)]
pub struct TxResponse {
    pub results: Vec<ResultBlock>,
    pub errors: Vec<WireError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TxInfo>,
    #[serde(rename = "lastBookmarks", skip_serializing_if = "Option::is_none")]
    pub last_bookmarks: Option<Vec<String>>,
}

impl TxResponse {
    pub fn new() -> Self {
        TxResponse {
            results: Vec::new(),
            errors: Vec::new(),
            commit: None,
            transaction: None,
            last_bookmarks: None,
        }
    }

    pub fn error(err: &NornicError) -> Self {
        let mut response = TxResponse::new();
        response.errors.push(WireError::from(err));
        response
    }
}

impl Default for TxResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// Meta entry for one returned value: entity identity or null for scalars.
fn meta_json(value: &CypherValue, deleted: &rustc_hash::FxHashSet<String>) -> Json {
    match value {
        CypherValue::Node(node) => serde_json::json!({
            "id": node.ordinal,
            "elementId": node.id,
            "type": "node",
            "deleted": deleted.contains(&node.id),
        }),
        CypherValue::Edge(edge) => serde_json::json!({
            "id": edge.ordinal,
            "elementId": edge.id,
            "type": "relationship",
            "deleted": deleted.contains(&edge.id),
        }),
        CypherValue::Value(_) => Json::Null,
    }
}

fn graph_json(values: &[CypherValue]) -> Json {
    let mut nodes = Vec::new();
    let mut relationships = Vec::new();
    for value in values {
        match value {
            CypherValue::Node(node) => nodes.push(serde_json::json!({
                "id": node.ordinal.to_string(),
                "elementId": node.id,
                "labels": node.labels,
                "properties": node.to_wire()["properties"],
            })),
            CypherValue::Edge(edge) => relationships.push(serde_json::json!({
                "id": edge.ordinal.to_string(),
                "elementId": edge.id,
                "type": edge.edge_type,
                "startNode": edge.start,
                "endNode": edge.end,
                "properties": CypherValue::Edge(edge.clone()).row_json(),
            })),
            CypherValue::Value(_) => {}
        }
    }
    serde_json::json!({ "nodes": nodes, "relationships": relationships })
}

/// Renders one statement outcome into the wire result block.
pub fn result_block(
    outcome: &ExecOutcome,
    stats: &WriteStats,
    include_stats: bool,
    want_graph: bool,
) -> ResultBlock {
    let data = outcome
        .rows
        .iter()
        .map(|row| DataRow {
            row: row.iter().map(|v| v.row_json()).collect(),
            meta: row.iter().map(|v| meta_json(v, &outcome.deleted)).collect(),
            graph: want_graph.then(|| graph_json(row)),
        })
        .collect();
    ResultBlock {
        columns: outcome.columns.clone(),
        data,
        stats: include_stats.then(|| WireStats::from(stats)),
    }
}
