//! Data model for graph entities.
//!
//! Nodes and edges carry a stable string identifier (the `elementId` on the
//! wire), a monotonically assigned numeric ordinal (the legacy `id`), labels
//! or a relationship type, and a property map over [`PropertyValue`].
//!
//! Property values cross two codecs: the storage codec (self-describing,
//! lossless, used by the WAL and snapshots) is the derived serde
//! representation; the wire codec ([`PropertyValue::to_wire`] /
//! [`PropertyValue::from_wire`]) maps to plain JSON and owns the
//! integer/float coercion rule, so no other component needs to re-implement
//! it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{NornicError, Result};

/// Stable opaque identifier for a node.
pub type NodeId = String;

/// Stable opaque identifier for an edge.
pub type EdgeId = String;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Renders an epoch-millisecond stamp as RFC 3339 for the wire.
pub fn millis_to_rfc3339(millis: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .ok()
        .and_then(|t| {
            t.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| millis.to_string())
}

/// Value domain for node and edge properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// List of scalar values (no nested lists or vectors).
    List(Vec<PropertyValue>),
    /// Epoch milliseconds.
    Timestamp(i64),
    Vector(Vec<f32>),
}

/// Declared type for a PROPERTY TYPE constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    String,
    List,
    Timestamp,
    Vector,
}

impl ValueKind {
    pub fn parse(name: &str) -> Option<ValueKind> {
        match name.to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => Some(ValueKind::Bool),
            "INTEGER" | "INT" => Some(ValueKind::Int),
            "FLOAT" => Some(ValueKind::Float),
            "STRING" => Some(ValueKind::String),
            "LIST" => Some(ValueKind::List),
            "TIMESTAMP" | "DATETIME" => Some(ValueKind::Timestamp),
            "VECTOR" => Some(ValueKind::Vector),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Bool => "BOOLEAN",
            ValueKind::Int => "INTEGER",
            ValueKind::Float => "FLOAT",
            ValueKind::String => "STRING",
            ValueKind::List => "LIST",
            ValueKind::Timestamp => "TIMESTAMP",
            ValueKind::Vector => "VECTOR",
        }
    }
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(_) => Some(ValueKind::Bool),
            PropertyValue::Int(_) => Some(ValueKind::Int),
            PropertyValue::Float(_) => Some(ValueKind::Float),
            PropertyValue::String(_) => Some(ValueKind::String),
            PropertyValue::List(_) => Some(ValueKind::List),
            PropertyValue::Timestamp(_) => Some(ValueKind::Timestamp),
            PropertyValue::Vector(_) => Some(ValueKind::Vector),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Checks the value against a declared kind, applying the integer/float
    /// coercion rule: a float whose value equals its truncation satisfies an
    /// INTEGER declaration. Null always passes (EXISTS is a separate
    /// constraint).
    pub fn conforms_to(&self, kind: ValueKind) -> bool {
        match (self, kind) {
            (PropertyValue::Null, _) => true,
            (PropertyValue::Float(f), ValueKind::Int) => f.trunc() == *f && f.is_finite(),
            (PropertyValue::Int(_), ValueKind::Float) => true,
            _ => self.kind() == Some(kind),
        }
    }

    /// Canonical byte form used in property-index keys and constraint
    /// sentinels. Integral floats collapse onto the integer form so that a
    /// value surviving a JSON round trip still hits the same sentinel.
    /// Unindexable values (null, vectors, nested lists) yield `None`.
    pub fn index_key(&self) -> Option<String> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(b) => Some(format!("b:{b}")),
            PropertyValue::Int(i) => Some(format!("i:{i}")),
            PropertyValue::Float(f) => {
                if f.is_finite() && f.trunc() == *f && f.abs() < 9.0e18 {
                    Some(format!("i:{}", *f as i64))
                } else {
                    Some(format!("f:{f}"))
                }
            }
            PropertyValue::String(s) => Some(format!("s:{s}")),
            PropertyValue::Timestamp(t) => Some(format!("t:{t}")),
            PropertyValue::List(_) | PropertyValue::Vector(_) => None,
        }
    }

    /// Wire (plain JSON) rendering of the value.
    pub fn to_wire(&self) -> Json {
        match self {
            PropertyValue::Null => Json::Null,
            PropertyValue::Bool(b) => Json::Bool(*b),
            PropertyValue::Int(i) => Json::from(*i),
            PropertyValue::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number)
            }
            PropertyValue::String(s) => Json::String(s.clone()),
            PropertyValue::List(items) => {
                Json::Array(items.iter().map(PropertyValue::to_wire).collect())
            }
            PropertyValue::Timestamp(t) => Json::String(millis_to_rfc3339(*t)),
            PropertyValue::Vector(v) => Json::Array(
                v.iter()
                    .map(|f| {
                        serde_json::Number::from_f64(*f as f64).map_or(Json::Null, Json::Number)
                    })
                    .collect(),
            ),
        }
    }

    /// Decodes a plain JSON value from the wire. Integral numbers become
    /// `Int`, everything else with a fractional part becomes `Float`. Arrays
    /// of numbers decode as `List` (vectors are only ever produced by the
    /// embedding pipeline, not accepted from clients).
    pub fn from_wire(value: &Json) -> Result<PropertyValue> {
        match value {
            Json::Null => Ok(PropertyValue::Null),
            Json::Bool(b) => Ok(PropertyValue::Bool(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(PropertyValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(PropertyValue::Float(f))
                } else {
                    Err(NornicError::InvalidRequest(format!(
                        "unrepresentable number {n}"
                    )))
                }
            }
            Json::String(s) => Ok(PropertyValue::String(s.clone())),
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let scalar = PropertyValue::from_wire(item)?;
                    if matches!(scalar, PropertyValue::List(_) | PropertyValue::Vector(_)) {
                        return Err(NornicError::InvalidRequest(
                            "nested lists are not supported as property values".into(),
                        ));
                    }
                    out.push(scalar);
                }
                Ok(PropertyValue::List(out))
            }
            Json::Object(_) => Err(NornicError::InvalidRequest(
                "maps are not supported as property values".into(),
            )),
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Decodes a JSON object into a property map using the wire codec.
pub fn properties_from_wire(map: &serde_json::Map<String, Json>) -> Result<Properties> {
    let mut out = Properties::new();
    for (key, value) in map {
        out.insert(key.clone(), PropertyValue::from_wire(value)?);
    }
    Ok(out)
}

/// An embedding vector together with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
    pub dimension: usize,
}

/// A graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Monotonic numeric ordinal, surfaced as the legacy wire `id`.
    pub ordinal: u64,
    pub labels: Vec<String>,
    pub properties: Properties,
    /// Epoch milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

/// A directed, typed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub ordinal: u64,
    pub start: NodeId,
    pub end: NodeId,
    pub edge_type: String,
    pub properties: Properties,
    pub created_at: i64,
}

impl Node {
    /// JSON shape used by the extension endpoints (`/search`, `/similar`).
    pub fn to_wire(&self) -> Json {
        let mut props = serde_json::Map::new();
        for (k, v) in &self.properties {
            props.insert(k.clone(), v.to_wire());
        }
        serde_json::json!({
            "id": self.id,
            "labels": self.labels,
            "properties": Json::Object(props),
            "created_at": millis_to_rfc3339(self.created_at),
        })
    }
}
