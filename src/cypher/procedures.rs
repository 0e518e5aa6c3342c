//! Procedure registry backing `CALL`.
//!
//! Procedures are explicit capability handles registered into the registry
//! at startup; plugins get the same registration surface and unloading
//! removes exactly what was registered.

use std::collections::BTreeMap;

use crate::error::{NornicError, Result};
use crate::model::PropertyValue;
use crate::schema::SchemaCatalog;
use crate::search::vector;
use crate::storage::graph::GraphView;
use crate::storage::keys;

use super::CypherValue;

pub struct ProcContext<'a> {
    pub view: &'a GraphView,
    pub catalog: &'a SchemaCatalog,
}

pub struct ProcOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CypherValue>>,
}

pub type ProcHandler = fn(&ProcContext<'_>, &[PropertyValue]) -> Result<ProcOutput>;

pub struct ProcedureEntry {
    pub name: String,
    pub description: String,
    handler: ProcHandler,
}

/// Name → handler registry. Built once at startup; plugin loading registers
/// additional handles, unloading removes them.
pub struct ProcedureRegistry {
    entries: BTreeMap<String, ProcedureEntry>,
}

impl ProcedureRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with the built-in database procedures.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("db.labels", "List node labels and counts", proc_labels);
        registry.register(
            "db.relationshipTypes",
            "List relationship types and counts",
            proc_relationship_types,
        );
        registry.register(
            "db.index.vector.queryNodes",
            "Exact-scan vector similarity query over an index",
            proc_vector_query,
        );
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: ProcHandler,
    ) {
        let name = name.into();
        self.entries.insert(
            name.clone(),
            ProcedureEntry {
                name,
                description: description.into(),
                handler,
            },
        );
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn call(
        &self,
        name: &str,
        ctx: &ProcContext<'_>,
        args: &[PropertyValue],
    ) -> Result<ProcOutput> {
        let entry = self.entries.get(name).ok_or_else(|| {
            NornicError::Syntax(format!("unknown procedure {name}"))
        })?;
        (entry.handler)(ctx, args)
    }
}

fn proc_labels(ctx: &ProcContext<'_>, _args: &[PropertyValue]) -> Result<ProcOutput> {
    let rows = ctx
        .catalog
        .labels()
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(label, _)| vec![CypherValue::Value(PropertyValue::String(label))])
        .collect();
    Ok(ProcOutput {
        columns: vec!["label".into()],
        rows,
    })
}

fn proc_relationship_types(ctx: &ProcContext<'_>, _args: &[PropertyValue]) -> Result<ProcOutput> {
    let rows = ctx
        .catalog
        .rel_types()
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(rel, _)| vec![CypherValue::Value(PropertyValue::String(rel))])
        .collect();
    Ok(ProcOutput {
        columns: vec!["relationshipType".into()],
        rows,
    })
}

fn proc_vector_query(ctx: &ProcContext<'_>, args: &[PropertyValue]) -> Result<ProcOutput> {
    let [name, k, query] = args else {
        return Err(NornicError::Syntax(
            "db.index.vector.queryNodes(name, k, vector) takes three arguments".into(),
        ));
    };
    let name = name
        .as_str()
        .ok_or_else(|| NornicError::Syntax("index name must be a string".into()))?;
    let k = match k {
        PropertyValue::Int(k) if *k > 0 => *k as usize,
        _ => return Err(NornicError::Syntax("k must be a positive integer".into())),
    };
    let query = floats_of(query)?;
    let def = ctx
        .catalog
        .vector_index(name)
        .ok_or_else(|| NornicError::not_found("vector index", name))?;
    if query.len() != def.dimension {
        return Err(NornicError::InvalidRequest(format!(
            "query vector has dimension {}, index {} expects {}",
            query.len(),
            def.name,
            def.dimension
        )));
    }

    // Exact scan over the index's members (an empty label means every
    // node) carrying a dimension-matched embedding.
    let mut candidates: Vec<(String, Vec<f32>)> = Vec::new();
    let nodes = if def.label.is_empty() {
        ctx.view.all_nodes(None, usize::MAX)?.0
    } else {
        let label_lc = def.label.to_lowercase();
        let prefix = keys::label_scan_prefix(&label_lc);
        let mut ids = Vec::new();
        ctx.view.kv().scan_while(&prefix, |key, _| {
            if let Some(id) = keys::last_segment(key) {
                ids.push(id.to_string());
            }
            true
        });
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = ctx.view.try_get_node(&id)? {
                nodes.push(node);
            }
        }
        nodes
    };
    for node in nodes {
        if let Some(embedding) = &node.embedding {
            if embedding.dimension == def.dimension {
                candidates.push((node.id.clone(), embedding.vector.clone()));
            }
        }
    }
    let ranked = vector::top_n(
        &query,
        candidates.iter().map(|(id, v)| (id.as_str(), v.as_slice())),
        k,
    );

    let mut rows = Vec::with_capacity(ranked.len());
    for (id, score) in ranked {
        let node = ctx.view.get_node(&id)?;
        rows.push(vec![
            CypherValue::Node(node),
            CypherValue::Value(PropertyValue::Float(score as f64)),
        ]);
    }
    Ok(ProcOutput {
        columns: vec!["node".into(), "score".into()],
        rows,
    })
}

fn floats_of(value: &PropertyValue) -> Result<Vec<f32>> {
    match value {
        PropertyValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    PropertyValue::Float(f) => out.push(*f as f32),
                    PropertyValue::Int(i) => out.push(*i as f32),
                    _ => {
                        return Err(NornicError::Syntax(
                            "vector argument must be a list of numbers".into(),
                        ))
                    }
                }
            }
            Ok(out)
        }
        PropertyValue::Vector(v) => Ok(v.clone()),
        _ => Err(NornicError::Syntax(
            "vector argument must be a list of numbers".into(),
        )),
    }
}
