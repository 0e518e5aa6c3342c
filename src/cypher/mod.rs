//! Cypher subset: lexer, parser and executor for the statements the HTTP
//! transaction surface accepts.

pub mod ast;
pub mod executor;
pub mod lexer;
pub mod parser;
pub mod procedures;

use serde_json::Value as Json;

use crate::model::{Edge, Node, PropertyValue};

pub use ast::{Statement, StatementKind};
pub use executor::{ExecContext, ExecOutcome, OrdinalAllocator};
pub use parser::parse;
pub use procedures::ProcedureRegistry;

/// Runtime value flowing through the executor and out to the wire.
#[derive(Debug, Clone)]
pub enum CypherValue {
    Value(PropertyValue),
    Node(Node),
    Edge(Edge),
}

impl CypherValue {
    pub fn null() -> Self {
        CypherValue::Value(PropertyValue::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CypherValue::Value(PropertyValue::Null))
    }

    /// The `row` rendering: entities appear as their property maps, scalars
    /// as plain JSON.
    pub fn row_json(&self) -> Json {
        match self {
            CypherValue::Value(v) => v.to_wire(),
            CypherValue::Node(n) => {
                let mut map = serde_json::Map::new();
                for (k, v) in &n.properties {
                    map.insert(k.clone(), v.to_wire());
                }
                Json::Object(map)
            }
            CypherValue::Edge(e) => {
                let mut map = serde_json::Map::new();
                for (k, v) in &e.properties {
                    map.insert(k.clone(), v.to_wire());
                }
                Json::Object(map)
            }
        }
    }
}
