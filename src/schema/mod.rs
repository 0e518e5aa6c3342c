//! Schema catalog: constraints, label and relationship-type dictionaries,
//! full-text configuration and vector index declarations.
//!
//! Validation happens in two places. Per-mutation validation
//! ([`node_sentinels`] / [`edge_sentinels`] plus [`diff_sentinels`]) runs
//! before a graph batch is built and yields the constraint-sentinel changes
//! that ride in the batch. Validation on constraint creation is a full label
//! scan owned by the engine; the catalog only contributes the
//! creation lock that serializes it against conflicting writers.

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{NornicError, Result};
use crate::model::{Edge, Node, PropertyValue, ValueKind};
use crate::storage::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Unique,
    NodeKey,
    Exists,
    PropType,
    RelUnique,
    RelExists,
}

impl ConstraintKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConstraintKind::Unique => "UNIQUE",
            ConstraintKind::NodeKey => "NODE KEY",
            ConstraintKind::Exists => "EXISTS",
            ConstraintKind::PropType => "PROPERTY TYPE",
            ConstraintKind::RelUnique => "RELATIONSHIP UNIQUE",
            ConstraintKind::RelExists => "RELATIONSHIP EXISTS",
        }
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, ConstraintKind::RelUnique | ConstraintKind::RelExists)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    /// Label for node constraints, relationship type for edge constraints
    /// (display form).
    pub label: String,
    pub properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_kind: Option<ValueKind>,
}

impl Constraint {
    pub fn label_lc(&self) -> String {
        self.label.to_lowercase()
    }

    /// Sentinel namespace for this constraint's keys.
    pub fn sentinel_name(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulltextConfig {
    /// Lowercased labels covered by the index; empty means every label.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Property names whose string values are indexed.
    pub properties: Vec<String>,
}

impl Default for FulltextConfig {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            properties: vec![
                "name".into(),
                "title".into(),
                "description".into(),
                "content".into(),
                "text".into(),
            ],
        }
    }
}

impl FulltextConfig {
    pub fn covers_label(&self, labels_lc: &[String]) -> bool {
        self.labels.is_empty() || labels_lc.iter().any(|l| self.labels.contains(l))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexDef {
    pub name: String,
    pub label: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictEntry {
    pub display: String,
    pub count: u64,
}

/// Serialized catalog state, embedded in WAL snapshots and the KV meta key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub fulltext: Option<FulltextConfig>,
    #[serde(default)]
    pub vector_indexes: Vec<VectorIndexDef>,
    #[serde(default)]
    pub labels: BTreeMap<String, DictEntry>,
    #[serde(default)]
    pub rel_types: BTreeMap<String, DictEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    constraints: BTreeMap<String, Constraint>,
    labels: BTreeMap<String, DictEntry>,
    rel_types: BTreeMap<String, DictEntry>,
    fulltext: FulltextConfig,
    vector_indexes: BTreeMap<String, VectorIndexDef>,
}

/// Shared catalog. Reads take the shared lock; schema changes take the
/// exclusive lock and the dedicated creation lock when a data scan is
/// involved.
pub struct SchemaCatalog {
    inner: RwLock<Inner>,
    creation_lock: Mutex<()>,
}

impl SchemaCatalog {
    pub fn new(fulltext: FulltextConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                fulltext,
                ..Inner::default()
            }),
            creation_lock: Mutex::new(()),
        }
    }

    pub fn load(&self, snapshot: SchemaSnapshot) {
        let mut inner = self.inner.write();
        inner.constraints = snapshot
            .constraints
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        inner.labels = snapshot.labels;
        inner.rel_types = snapshot.rel_types;
        if let Some(ft) = snapshot.fulltext {
            inner.fulltext = ft;
        }
        inner.vector_indexes = snapshot
            .vector_indexes
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
    }

    pub fn snapshot(&self) -> SchemaSnapshot {
        let inner = self.inner.read();
        SchemaSnapshot {
            constraints: inner.constraints.values().cloned().collect(),
            fulltext: Some(inner.fulltext.clone()),
            vector_indexes: inner.vector_indexes.values().cloned().collect(),
            labels: inner.labels.clone(),
            rel_types: inner.rel_types.clone(),
        }
    }

    pub fn fulltext_config(&self) -> FulltextConfig {
        self.inner.read().fulltext.clone()
    }

    /// Canonicalizes a label to its stored display form, registering it on
    /// first sight. Lookups are case-insensitive, so `User` and `user` name
    /// the same label.
    pub fn canonical_label(&self, label: &str) -> Result<String> {
        validate_name(label, "label")?;
        let lc = label.to_lowercase();
        {
            let inner = self.inner.read();
            if let Some(entry) = inner.labels.get(&lc) {
                return Ok(entry.display.clone());
            }
        }
        let mut inner = self.inner.write();
        let entry = inner.labels.entry(lc).or_insert_with(|| DictEntry {
            display: label.to_string(),
            count: 0,
        });
        Ok(entry.display.clone())
    }

    pub fn canonical_rel_type(&self, edge_type: &str) -> Result<String> {
        validate_name(edge_type, "relationship type")?;
        let lc = edge_type.to_lowercase();
        {
            let inner = self.inner.read();
            if let Some(entry) = inner.rel_types.get(&lc) {
                return Ok(entry.display.clone());
            }
        }
        let mut inner = self.inner.write();
        let entry = inner.rel_types.entry(lc).or_insert_with(|| DictEntry {
            display: edge_type.to_string(),
            count: 0,
        });
        Ok(entry.display.clone())
    }

    /// Applies committed cardinality deltas to the dictionaries.
    pub fn apply_counts(&self, label_deltas: &[(String, i64)], rel_deltas: &[(String, i64)]) {
        let mut inner = self.inner.write();
        for (label, delta) in label_deltas {
            let lc = label.to_lowercase();
            let entry = inner.labels.entry(lc).or_insert_with(|| DictEntry {
                display: label.clone(),
                count: 0,
            });
            entry.count = entry.count.saturating_add_signed(*delta);
        }
        for (rel, delta) in rel_deltas {
            let lc = rel.to_lowercase();
            let entry = inner.rel_types.entry(lc).or_insert_with(|| DictEntry {
                display: rel.clone(),
                count: 0,
            });
            entry.count = entry.count.saturating_add_signed(*delta);
        }
    }

    /// Replaces the dictionaries wholesale; recovery recomputes cardinality
    /// from the store rather than trusting replayed deltas.
    pub fn replace_counts(
        &self,
        labels: BTreeMap<String, DictEntry>,
        rel_types: BTreeMap<String, DictEntry>,
    ) {
        let mut inner = self.inner.write();
        inner.labels = labels;
        inner.rel_types = rel_types;
    }

    pub fn labels(&self) -> Vec<(String, u64)> {
        self.inner
            .read()
            .labels
            .values()
            .map(|e| (e.display.clone(), e.count))
            .collect()
    }

    pub fn rel_types(&self) -> Vec<(String, u64)> {
        self.inner
            .read()
            .rel_types
            .values()
            .map(|e| (e.display.clone(), e.count))
            .collect()
    }

    pub fn constraints(&self) -> Vec<Constraint> {
        self.inner.read().constraints.values().cloned().collect()
    }

    pub fn constraints_for_label(&self, labels_lc: &[String]) -> Vec<Constraint> {
        self.inner
            .read()
            .constraints
            .values()
            .filter(|c| !c.kind.is_relationship() && labels_lc.contains(&c.label_lc()))
            .cloned()
            .collect()
    }

    pub fn constraints_for_rel_type(&self, type_lc: &str) -> Vec<Constraint> {
        self.inner
            .read()
            .constraints
            .values()
            .filter(|c| c.kind.is_relationship() && c.label_lc() == type_lc)
            .cloned()
            .collect()
    }

    pub fn has_constraint(&self, name: &str) -> bool {
        self.inner.read().constraints.contains_key(name)
    }

    /// Serializes constraint creation (and the data scan that precedes it)
    /// against concurrent constraint creation.
    pub fn creation_guard(&self) -> MutexGuard<'_, ()> {
        self.creation_lock.lock()
    }

    /// Installs a validated constraint. The caller holds the creation guard
    /// and has already scanned existing data.
    pub fn add_constraint(&self, constraint: Constraint) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.constraints.contains_key(&constraint.name) {
            return Err(NornicError::InvalidRequest(format!(
                "constraint {} already exists",
                constraint.name
            )));
        }
        inner
            .constraints
            .insert(constraint.name.clone(), constraint);
        Ok(())
    }

    pub fn drop_constraint(&self, name: &str) -> Result<Constraint> {
        self.inner
            .write()
            .constraints
            .remove(name)
            .ok_or_else(|| NornicError::UnknownConstraint(name.to_string()))
    }

    pub fn vector_indexes(&self) -> Vec<VectorIndexDef> {
        self.inner.read().vector_indexes.values().cloned().collect()
    }

    pub fn vector_index(&self, name: &str) -> Option<VectorIndexDef> {
        self.inner.read().vector_indexes.get(name).cloned()
    }

    pub fn define_vector_index(&self, def: VectorIndexDef) {
        self.inner
            .write()
            .vector_indexes
            .insert(def.name.clone(), def);
    }
}

pub fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() || name.len() > 256 || name.contains('/') {
        return Err(NornicError::InvalidRequest(format!(
            "invalid {what} name {name:?}"
        )));
    }
    Ok(())
}

/// Computed sentinel entries for one record, produced while checking the
/// non-sentinel constraints (EXISTS, PROPERTY TYPE).
pub fn node_sentinels(
    constraints: &[Constraint],
    node: &Node,
) -> Result<Vec<(String, String)>> {
    let labels_lc: Vec<String> = node.labels.iter().map(|l| l.to_lowercase()).collect();
    let mut sentinels = Vec::new();
    for constraint in constraints {
        if constraint.kind.is_relationship() || !labels_lc.contains(&constraint.label_lc()) {
            continue;
        }
        check_and_collect(constraint, &node.properties, &node.id, &mut sentinels)?;
    }
    Ok(sentinels)
}

/// Sentinel collection that ignores validation failures. Used when
/// replaying trusted history against a catalog that may since have gained
/// stricter constraints.
pub fn node_sentinels_lenient(constraints: &[Constraint], node: &Node) -> Vec<(String, String)> {
    let labels_lc: Vec<String> = node.labels.iter().map(|l| l.to_lowercase()).collect();
    let mut sentinels = Vec::new();
    for constraint in constraints {
        if constraint.kind.is_relationship() || !labels_lc.contains(&constraint.label_lc()) {
            continue;
        }
        let _ = check_and_collect(constraint, &node.properties, &node.id, &mut sentinels);
    }
    sentinels
}

pub fn edge_sentinels_lenient(constraints: &[Constraint], edge: &Edge) -> Vec<(String, String)> {
    let type_lc = edge.edge_type.to_lowercase();
    let mut sentinels = Vec::new();
    for constraint in constraints {
        if !constraint.kind.is_relationship() || constraint.label_lc() != type_lc {
            continue;
        }
        let _ = check_and_collect(constraint, &edge.properties, &edge.id, &mut sentinels);
    }
    sentinels
}

pub fn edge_sentinels(
    constraints: &[Constraint],
    edge: &Edge,
) -> Result<Vec<(String, String)>> {
    let type_lc = edge.edge_type.to_lowercase();
    let mut sentinels = Vec::new();
    for constraint in constraints {
        if !constraint.kind.is_relationship() || constraint.label_lc() != type_lc {
            continue;
        }
        check_and_collect(constraint, &edge.properties, &edge.id, &mut sentinels)?;
    }
    Ok(sentinels)
}

fn check_and_collect(
    constraint: &Constraint,
    properties: &crate::model::Properties,
    id: &str,
    out: &mut Vec<(String, String)>,
) -> Result<()> {
    let lookup = |prop: &String| properties.get(prop).filter(|v| !v.is_null());
    match constraint.kind {
        ConstraintKind::Exists | ConstraintKind::RelExists => {
            for prop in &constraint.properties {
                if lookup(prop).is_none() {
                    return Err(NornicError::constraint(
                        constraint.kind.name(),
                        &constraint.label,
                        &constraint.properties,
                        Some(id.to_string()),
                        format!("property {prop} must be non-null"),
                    ));
                }
            }
        }
        ConstraintKind::PropType => {
            let kind = constraint.value_kind.ok_or_else(|| {
                NornicError::Internal(format!(
                    "type constraint {} has no declared type",
                    constraint.name
                ))
            })?;
            for prop in &constraint.properties {
                if let Some(value) = properties.get(prop) {
                    if !value.conforms_to(kind) {
                        return Err(NornicError::SchemaMismatch {
                            label: constraint.label.clone(),
                            property: prop.clone(),
                            message: format!(
                                "expected {}, got {}",
                                kind.name(),
                                value.kind().map(|k| k.name()).unwrap_or("NULL")
                            ),
                        });
                    }
                }
            }
        }
        ConstraintKind::Unique | ConstraintKind::RelUnique => {
            let prop = &constraint.properties[0];
            if let Some(value) = lookup(prop) {
                if let Some(key) = value.index_key() {
                    out.push((constraint.sentinel_name(), key));
                }
            }
        }
        ConstraintKind::NodeKey => {
            let mut parts = Vec::with_capacity(constraint.properties.len());
            for prop in &constraint.properties {
                let value = lookup(prop).ok_or_else(|| {
                    NornicError::constraint(
                        constraint.kind.name(),
                        &constraint.label,
                        &constraint.properties,
                        Some(id.to_string()),
                        format!("missing {prop}"),
                    )
                })?;
                parts.push(value.index_key().ok_or_else(|| {
                    NornicError::constraint(
                        constraint.kind.name(),
                        &constraint.label,
                        &constraint.properties,
                        Some(id.to_string()),
                        format!("{prop} is not a key-able value"),
                    )
                })?);
            }
            out.push((constraint.sentinel_name(), parts.join("|")));
        }
    }
    Ok(())
}

/// Sentinel changes for a mutation: keys to occupy and keys to release.
#[derive(Debug, Default)]
pub struct SentinelChange {
    pub add: Vec<(Vec<u8>, String)>,
    pub remove: Vec<Vec<u8>>,
}

/// Diffs the sentinel sets of the pre- and post-images. Occupancy of the
/// additions is checked against `occupied` (the caller passes a lookup into
/// its working KV state).
pub fn diff_sentinels<F>(
    old: &[(String, String)],
    new: &[(String, String)],
    owner_id: &str,
    kind_label: (&str, &str),
    occupied: F,
) -> Result<SentinelChange>
where
    F: Fn(&[u8]) -> Option<String>,
{
    let mut change = SentinelChange::default();
    for entry in new {
        if old.contains(entry) {
            continue;
        }
        let key = keys::sentinel_key(&entry.0, &entry.1);
        if let Some(owner) = occupied(&key) {
            if owner != owner_id {
                return Err(NornicError::constraint(
                    kind_label.0,
                    kind_label.1,
                    &[entry.0.clone()],
                    Some(owner),
                    format!("value already exists for constraint {}", entry.0),
                ));
            }
        }
        change.add.push((key, owner_id.to_string()));
    }
    for entry in old {
        if !new.contains(entry) {
            change.remove.push(keys::sentinel_key(&entry.0, &entry.1));
        }
    }
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Properties;

    fn node(id: &str, labels: &[&str], props: &[(&str, PropertyValue)]) -> Node {
        let mut properties = Properties::new();
        for (k, v) in props {
            properties.insert(k.to_string(), v.clone());
        }
        Node {
            id: id.to_string(),
            ordinal: 1,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            properties,
            created_at: 0,
            embedding: None,
        }
    }

    fn unique(name: &str, label: &str, prop: &str) -> Constraint {
        Constraint {
            name: name.into(),
            kind: ConstraintKind::Unique,
            label: label.into(),
            properties: vec![prop.into()],
            value_kind: None,
        }
    }

    #[test]
    fn labels_are_case_insensitive() {
        let catalog = SchemaCatalog::new(FulltextConfig::default());
        let first = catalog.canonical_label("User").unwrap();
        let second = catalog.canonical_label("user").unwrap();
        assert_eq!(first, "User");
        assert_eq!(second, "User");
    }

    #[test]
    fn unique_sentinel_skips_null_values() {
        let constraints = vec![unique("user_email", "User", "email")];
        let sparse = node("a", &["User"], &[]);
        assert!(node_sentinels(&constraints, &sparse).unwrap().is_empty());

        let full = node(
            "a",
            &["User"],
            &[("email", PropertyValue::String("a@x".into()))],
        );
        let sentinels = node_sentinels(&constraints, &full).unwrap();
        assert_eq!(sentinels, vec![("user_email".into(), "s:a@x".into())]);
    }

    #[test]
    fn node_key_requires_every_property() {
        let constraint = Constraint {
            name: "user_key".into(),
            kind: ConstraintKind::NodeKey,
            label: "User".into(),
            properties: vec!["username".into(), "domain".into()],
            value_kind: None,
        };
        let partial = node(
            "a",
            &["User"],
            &[("username", PropertyValue::String("alice".into()))],
        );
        let err = node_sentinels(&[constraint], &partial).unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn diff_rejects_foreign_occupancy() {
        let new = vec![("user_email".to_string(), "s:a@x".to_string())];
        let err = diff_sentinels(&[], &new, "me", ("UNIQUE", "User"), |_| {
            Some("someone-else".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, NornicError::ConstraintViolation { .. }));

        let change =
            diff_sentinels(&[], &new, "me", ("UNIQUE", "User"), |_| None).unwrap();
        assert_eq!(change.add.len(), 1);
    }

    #[test]
    fn type_constraint_applies_coercion() {
        let constraint = Constraint {
            name: "age_int".into(),
            kind: ConstraintKind::PropType,
            label: "User".into(),
            properties: vec!["age".into()],
            value_kind: Some(ValueKind::Int),
        };
        let coerced = node("a", &["User"], &[("age", PropertyValue::Float(30.0))]);
        assert!(node_sentinels(&[constraint.clone()], &coerced).is_ok());
        let bad = node("a", &["User"], &[("age", PropertyValue::Float(30.5))]);
        assert!(node_sentinels(&[constraint], &bad).is_err());
    }
}
