//! Clause-pipeline executor.
//!
//! Bindings flow through the clauses as rows (alias → runtime value). Reads
//! resolve against the workspace's working image, so a statement sees the
//! writes of the statements before it in the same transaction; the engine
//! wraps each statement in a workspace mark and reverts it wholesale on
//! failure.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::error::{NornicError, Result};
use crate::model::{now_millis, Edge, Node, Properties, PropertyValue};
use crate::schema::{FulltextConfig, SchemaCatalog};
use crate::storage::graph::{Direction, GraphView, NodeDelta, NodeSpec, Workspace};

use super::ast::*;
use super::procedures::{ProcContext, ProcedureRegistry};
use super::CypherValue;

/// Allocates the monotonically increasing entity ordinals.
pub trait OrdinalAllocator: Send + Sync {
    fn next_ordinal(&self) -> u64;
}

pub struct ExecContext<'a> {
    pub catalog: &'a SchemaCatalog,
    pub fulltext: &'a FulltextConfig,
    pub procedures: &'a ProcedureRegistry,
    pub params: BTreeMap<String, PropertyValue>,
    pub ordinals: &'a dyn OrdinalAllocator,
}

#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CypherValue>>,
    /// Ids deleted by this statement, flagged in wire metadata.
    pub deleted: FxHashSet<String>,
}

type Row = BTreeMap<String, CypherValue>;

pub fn execute_query(
    query: &Query,
    ws: &mut Workspace,
    ctx: &ExecContext<'_>,
) -> Result<ExecOutcome> {
    let mut rows: Vec<Row> = vec![Row::new()];
    let mut deleted: FxHashSet<String> = FxHashSet::default();
    let mut call_columns: Option<Vec<String>> = None;
    let mut returned: Option<ExecOutcome> = None;

    for clause in &query.clauses {
        if returned.is_some() {
            return Err(NornicError::Syntax(
                "RETURN must be the final clause".into(),
            ));
        }
        match clause {
            Clause::Match { patterns } => {
                for pattern in patterns {
                    let mut next = Vec::new();
                    for row in &rows {
                        next.extend(expand_pattern(row, pattern, &ws.view(), ctx)?);
                    }
                    rows = next;
                }
            }
            Clause::Where(expr) => {
                let mut kept = Vec::new();
                for row in rows {
                    if truthy(&eval(expr, &row, ctx)?) {
                        kept.push(row);
                    }
                }
                rows = kept;
            }
            Clause::Create { patterns } => {
                for row in &mut rows {
                    for pattern in patterns {
                        apply_create(row, pattern, ws, ctx)?;
                    }
                }
            }
            Clause::Merge { pattern } => {
                let mut next = Vec::new();
                for row in &rows {
                    let matched = expand_pattern(row, pattern, &ws.view(), ctx)?;
                    if matched.is_empty() {
                        let mut created = row.clone();
                        apply_create(&mut created, pattern, ws, ctx)?;
                        next.push(created);
                    } else {
                        next.extend(matched);
                    }
                }
                rows = next;
            }
            Clause::Set(items) => {
                for item in items {
                    apply_set(item, &mut rows, ws, ctx)?;
                }
            }
            Clause::Remove(items) => {
                for item in items {
                    apply_remove(item, &mut rows, ws, ctx)?;
                }
            }
            Clause::Delete { detach, exprs } => {
                apply_delete(*detach, exprs, &rows, ws, ctx, &mut deleted)?;
            }
            Clause::Call {
                procedure,
                args,
                yields,
            } => {
                let empty = Row::new();
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    match eval(arg, &empty, ctx)? {
                        CypherValue::Value(v) => arg_values.push(v),
                        _ => {
                            return Err(NornicError::Syntax(
                                "procedure arguments must be scalar values".into(),
                            ))
                        }
                    }
                }
                let view = ws.view();
                let proc_ctx = ProcContext {
                    view: &view,
                    catalog: ctx.catalog,
                };
                let output = ctx.procedures.call(procedure, &proc_ctx, &arg_values)?;
                let selected: Vec<String> = if yields.is_empty() {
                    output.columns.clone()
                } else {
                    for y in yields {
                        if !output.columns.contains(y) {
                            return Err(NornicError::Syntax(format!(
                                "procedure {procedure} does not yield {y}"
                            )));
                        }
                    }
                    yields.clone()
                };
                let mut next = Vec::new();
                for row in &rows {
                    for proc_row in &output.rows {
                        let mut bound = row.clone();
                        for name in &selected {
                            let idx = output
                                .columns
                                .iter()
                                .position(|c| c == name)
                                .unwrap_or_default();
                            bound.insert(name.clone(), proc_row[idx].clone());
                        }
                        next.push(bound);
                    }
                }
                rows = next;
                call_columns = Some(selected);
            }
            Clause::Return {
                items,
                distinct,
                limit,
            } => {
                returned = Some(project(items, *distinct, *limit, &rows, ctx)?);
            }
        }
    }

    let mut outcome = match returned {
        Some(outcome) => outcome,
        None => match call_columns {
            Some(columns) => {
                let mut out_rows = Vec::with_capacity(rows.len());
                for row in &rows {
                    out_rows.push(
                        columns
                            .iter()
                            .map(|c| row.get(c).cloned().unwrap_or_else(CypherValue::null))
                            .collect(),
                    );
                }
                ExecOutcome {
                    columns,
                    rows: out_rows,
                    deleted: FxHashSet::default(),
                }
            }
            None => ExecOutcome::default(),
        },
    };
    outcome.deleted = deleted;
    Ok(outcome)
}

// ---- pattern matching ----

fn expand_pattern(
    row: &Row,
    pattern: &Pattern,
    view: &GraphView,
    ctx: &ExecContext<'_>,
) -> Result<Vec<Row>> {
    let starts = node_candidates(&pattern.start, row, view, ctx)?;
    let mut out = Vec::new();
    for start in starts {
        let mut bound = row.clone();
        if let Some(var) = &pattern.start.var {
            bound.insert(var.clone(), CypherValue::Node(start.clone()));
        }
        match &pattern.hop {
            None => out.push(bound),
            Some((rel, far_pattern)) => {
                let direction = match rel.direction {
                    RelDir::Out => Direction::Out,
                    RelDir::In => Direction::In,
                    RelDir::Undirected => Direction::Both,
                };
                for (edge, far) in
                    view.neighbors(&start.id, rel.rel_type.as_deref(), direction)?
                {
                    if !props_match(&edge.properties, &rel.props, &bound, ctx)? {
                        continue;
                    }
                    if !node_matches(&far, far_pattern, &bound, ctx)? {
                        continue;
                    }
                    if let Some(var) = &far_pattern.var {
                        if let Some(CypherValue::Node(existing)) = bound.get(var) {
                            if existing.id != far.id {
                                continue;
                            }
                        }
                    }
                    let mut with_hop = bound.clone();
                    if let Some(var) = &rel.var {
                        with_hop.insert(var.clone(), CypherValue::Edge(edge.clone()));
                    }
                    if let Some(var) = &far_pattern.var {
                        with_hop.insert(var.clone(), CypherValue::Node(far.clone()));
                    }
                    out.push(with_hop);
                }
            }
        }
    }
    Ok(out)
}

fn node_candidates(
    pattern: &NodePattern,
    row: &Row,
    view: &GraphView,
    ctx: &ExecContext<'_>,
) -> Result<Vec<Node>> {
    if let Some(var) = &pattern.var {
        if let Some(bound) = row.get(var) {
            return match bound {
                CypherValue::Node(node) => {
                    if node_matches(node, pattern, row, ctx)? {
                        Ok(vec![node.clone()])
                    } else {
                        Ok(Vec::new())
                    }
                }
                _ => Err(NornicError::Syntax(format!(
                    "variable {var} is not a node"
                ))),
            };
        }
    }

    // Prefer the property index, then the label index, then a full scan.
    let mut candidates: Option<Vec<Node>> = None;
    if let Some(label) = pattern.labels.first() {
        for (prop, expr) in &pattern.props {
            let value = scalar_of(eval(expr, row, ctx)?)?;
            if let Some(value_key) = value.index_key() {
                let ids = view.node_ids_by_property(label, prop, &value_key);
                let mut nodes = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(node) = view.try_get_node(&id)? {
                        nodes.push(node);
                    }
                }
                candidates = Some(nodes);
                break;
            }
        }
        if candidates.is_none() {
            candidates = Some(view.nodes_by_label(label, usize::MAX)?);
        }
    }
    let candidates = match candidates {
        Some(c) => c,
        None => view.all_nodes(None, usize::MAX)?.0,
    };

    let mut matched = Vec::new();
    for node in candidates {
        if node_matches(&node, pattern, row, ctx)? {
            matched.push(node);
        }
    }
    Ok(matched)
}

fn node_matches(
    node: &Node,
    pattern: &NodePattern,
    row: &Row,
    ctx: &ExecContext<'_>,
) -> Result<bool> {
    let node_labels_lc: Vec<String> = node.labels.iter().map(|l| l.to_lowercase()).collect();
    for label in &pattern.labels {
        if !node_labels_lc.contains(&label.to_lowercase()) {
            return Ok(false);
        }
    }
    props_match(&node.properties, &pattern.props, row, ctx)
}

fn props_match(
    properties: &Properties,
    expected: &[(String, Expr)],
    row: &Row,
    ctx: &ExecContext<'_>,
) -> Result<bool> {
    for (key, expr) in expected {
        let want = scalar_of(eval(expr, row, ctx)?)?;
        match properties.get(key) {
            Some(have) if values_equal(have, &want) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

// ---- mutations ----

fn apply_create(
    row: &mut Row,
    pattern: &Pattern,
    ws: &mut Workspace,
    ctx: &ExecContext<'_>,
) -> Result<()> {
    let start = resolve_or_create_node(row, &pattern.start, ws, ctx)?;
    if let Some((rel, far_pattern)) = &pattern.hop {
        let far = resolve_or_create_node(row, far_pattern, ws, ctx)?;
        let rel_type = rel.rel_type.as_deref().ok_or_else(|| {
            NornicError::Syntax("CREATE requires a relationship type".into())
        })?;
        let (from, to) = match rel.direction {
            RelDir::Out => (&start, &far),
            RelDir::In => (&far, &start),
            RelDir::Undirected => {
                return Err(NornicError::Syntax(
                    "CREATE requires a relationship direction".into(),
                ))
            }
        };
        let mut props = Properties::new();
        for (key, expr) in &rel.props {
            props.insert(key.clone(), scalar_of(eval(expr, row, ctx)?)?);
        }
        let edge = ws.create_edge(
            ctx.catalog,
            &from.id,
            &to.id,
            rel_type,
            props,
            ctx.ordinals.next_ordinal(),
        )?;
        if let Some(var) = &rel.var {
            row.insert(var.clone(), CypherValue::Edge(edge));
        }
    }
    Ok(())
}

fn resolve_or_create_node(
    row: &mut Row,
    pattern: &NodePattern,
    ws: &mut Workspace,
    ctx: &ExecContext<'_>,
) -> Result<Node> {
    if let Some(var) = &pattern.var {
        if let Some(bound) = row.get(var) {
            return match bound {
                CypherValue::Node(node) => {
                    if !pattern.labels.is_empty() || !pattern.props.is_empty() {
                        return Err(NornicError::Syntax(format!(
                            "variable {var} is already bound"
                        )));
                    }
                    Ok(node.clone())
                }
                _ => Err(NornicError::Syntax(format!(
                    "variable {var} is not a node"
                ))),
            };
        }
    }
    let mut properties = Properties::new();
    for (key, expr) in &pattern.props {
        let value = scalar_of(eval(expr, row, ctx)?)?;
        if !value.is_null() {
            properties.insert(key.clone(), value);
        }
    }
    let node = ws.create_node(
        ctx.catalog,
        ctx.fulltext,
        NodeSpec {
            id: None,
            labels: pattern.labels.clone(),
            properties,
        },
        ctx.ordinals.next_ordinal(),
    )?;
    if let Some(var) = &pattern.var {
        row.insert(var.clone(), CypherValue::Node(node.clone()));
    }
    Ok(node)
}

fn apply_set(
    item: &SetItem,
    rows: &mut [Row],
    ws: &mut Workspace,
    ctx: &ExecContext<'_>,
) -> Result<()> {
    for i in 0..rows.len() {
        match item {
            SetItem::Property { var, key, value } => {
                let value = scalar_of(eval(value, &rows[i], ctx)?)?;
                match rows[i].get(var) {
                    Some(CypherValue::Node(node)) => {
                        let id = node.id.clone();
                        let mut set_props = Properties::new();
                        set_props.insert(key.clone(), value);
                        let updated = ws.update_node(
                            ctx.catalog,
                            ctx.fulltext,
                            &id,
                            NodeDelta {
                                set_props,
                                ..NodeDelta::default()
                            },
                        )?;
                        rebind_node(rows, var, &updated);
                    }
                    Some(CypherValue::Edge(edge)) => {
                        let id = edge.id.clone();
                        let mut set_props = Properties::new();
                        set_props.insert(key.clone(), value);
                        let updated = ws.update_edge(ctx.catalog, &id, set_props)?;
                        rebind_edge(rows, var, &updated);
                    }
                    _ => {
                        return Err(NornicError::Syntax(format!(
                            "SET target {var} is not bound to an entity"
                        )))
                    }
                }
            }
            SetItem::Label { var, label } => match rows[i].get(var) {
                Some(CypherValue::Node(node)) => {
                    let id = node.id.clone();
                    let updated = ws.update_node(
                        ctx.catalog,
                        ctx.fulltext,
                        &id,
                        NodeDelta {
                            add_labels: vec![label.clone()],
                            ..NodeDelta::default()
                        },
                    )?;
                    rebind_node(rows, var, &updated);
                }
                _ => {
                    return Err(NornicError::Syntax(format!(
                        "SET label target {var} is not a node"
                    )))
                }
            },
        }
    }
    Ok(())
}

fn apply_remove(
    item: &RemoveItem,
    rows: &mut [Row],
    ws: &mut Workspace,
    ctx: &ExecContext<'_>,
) -> Result<()> {
    for i in 0..rows.len() {
        match item {
            RemoveItem::Property { var, key } => match rows[i].get(var) {
                Some(CypherValue::Node(node)) => {
                    let id = node.id.clone();
                    let mut set_props = Properties::new();
                    set_props.insert(key.clone(), PropertyValue::Null);
                    let updated = ws.update_node(
                        ctx.catalog,
                        ctx.fulltext,
                        &id,
                        NodeDelta {
                            set_props,
                            ..NodeDelta::default()
                        },
                    )?;
                    rebind_node(rows, var, &updated);
                }
                Some(CypherValue::Edge(edge)) => {
                    let id = edge.id.clone();
                    let mut set_props = Properties::new();
                    set_props.insert(key.clone(), PropertyValue::Null);
                    let updated = ws.update_edge(ctx.catalog, &id, set_props)?;
                    rebind_edge(rows, var, &updated);
                }
                _ => {
                    return Err(NornicError::Syntax(format!(
                        "REMOVE target {var} is not bound to an entity"
                    )))
                }
            },
            RemoveItem::Label { var, label } => match rows[i].get(var) {
                Some(CypherValue::Node(node)) => {
                    let id = node.id.clone();
                    let updated = ws.update_node(
                        ctx.catalog,
                        ctx.fulltext,
                        &id,
                        NodeDelta {
                            remove_labels: vec![label.clone()],
                            ..NodeDelta::default()
                        },
                    )?;
                    rebind_node(rows, var, &updated);
                }
                _ => {
                    return Err(NornicError::Syntax(format!(
                        "REMOVE label target {var} is not a node"
                    )))
                }
            },
        }
    }
    Ok(())
}

fn rebind_node(rows: &mut [Row], var: &str, node: &Node) {
    for row in rows.iter_mut() {
        if let Some(CypherValue::Node(existing)) = row.get(var) {
            if existing.id == node.id {
                row.insert(var.to_string(), CypherValue::Node(node.clone()));
            }
        }
    }
}

fn rebind_edge(rows: &mut [Row], var: &str, edge: &Edge) {
    for row in rows.iter_mut() {
        if let Some(CypherValue::Edge(existing)) = row.get(var) {
            if existing.id == edge.id {
                row.insert(var.to_string(), CypherValue::Edge(edge.clone()));
            }
        }
    }
}

fn apply_delete(
    detach: bool,
    exprs: &[Expr],
    rows: &[Row],
    ws: &mut Workspace,
    ctx: &ExecContext<'_>,
    deleted: &mut FxHashSet<String>,
) -> Result<()> {
    let mut edges: Vec<String> = Vec::new();
    let mut nodes: Vec<String> = Vec::new();
    for row in rows {
        for expr in exprs {
            match eval(expr, row, ctx)? {
                CypherValue::Edge(edge) => {
                    if !edges.contains(&edge.id) {
                        edges.push(edge.id);
                    }
                }
                CypherValue::Node(node) => {
                    if !nodes.contains(&node.id) {
                        nodes.push(node.id);
                    }
                }
                value if value.is_null() => {}
                _ => {
                    return Err(NornicError::Syntax(
                        "DELETE expects nodes or relationships".into(),
                    ))
                }
            }
        }
    }
    for id in edges {
        if deleted.insert(id.clone()) {
            ws.delete_edge(ctx.catalog, &id)?;
        }
    }
    for id in nodes {
        if deleted.insert(id.clone()) {
            ws.delete_node(ctx.catalog, ctx.fulltext, &id, detach)?;
        }
    }
    Ok(())
}

// ---- projection ----

fn project(
    items: &[ReturnItem],
    distinct: bool,
    limit: Option<usize>,
    rows: &[Row],
    ctx: &ExecContext<'_>,
) -> Result<ExecOutcome> {
    let columns: Vec<String> = items.iter().map(|i| i.column_name()).collect();
    let has_aggregate = items.iter().any(|i| i.expr.is_aggregate());

    let mut out_rows: Vec<Vec<CypherValue>> = if has_aggregate {
        aggregate_rows(items, rows, ctx)?
    } else {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut projected = Vec::with_capacity(items.len());
            for item in items {
                projected.push(eval(&item.expr, row, ctx)?);
            }
            out.push(projected);
        }
        out
    };

    if distinct {
        out_rows = dedup_rows(out_rows);
    }
    if let Some(limit) = limit {
        out_rows.truncate(limit);
    }
    Ok(ExecOutcome {
        columns,
        rows: out_rows,
        deleted: FxHashSet::default(),
    })
}

/// DISTINCT: keeps the first occurrence of each projected row. Entities
/// compare by identity, scalars by their wire rendering.
fn dedup_rows(rows: Vec<Vec<CypherValue>>) -> Vec<Vec<CypherValue>> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key = row
            .iter()
            .map(|v| match v {
                CypherValue::Node(n) => format!("n:{}", n.id),
                CypherValue::Edge(e) => format!("e:{}", e.id),
                CypherValue::Value(_) => {
                    serde_json::to_string(&v.row_json()).unwrap_or_default()
                }
            })
            .collect::<Vec<_>>()
            .join("\u{1}");
        if seen.insert(key) {
            out.push(row);
        }
    }
    out
}

#[derive(Default)]
struct AggState {
    count: u64,
    sum: f64,
    seen: u64,
    min: Option<PropertyValue>,
    max: Option<PropertyValue>,
}

fn aggregate_rows(
    items: &[ReturnItem],
    rows: &[Row],
    ctx: &ExecContext<'_>,
) -> Result<Vec<Vec<CypherValue>>> {
    // Non-aggregated items act as the grouping key, Neo4j style.
    let mut groups: Vec<(Vec<String>, Vec<CypherValue>, Vec<AggState>)> = Vec::new();
    let group_all = items.iter().all(|i| i.expr.is_aggregate());

    for row in rows {
        let mut key = Vec::new();
        let mut key_values = Vec::new();
        for item in items {
            if !item.expr.is_aggregate() {
                let value = eval(&item.expr, row, ctx)?;
                key.push(serde_json::to_string(&value.row_json()).unwrap_or_default());
                key_values.push(value);
            }
        }
        let idx = match groups.iter().position(|(k, _, _)| *k == key) {
            Some(idx) => idx,
            None => {
                groups.push((
                    key,
                    key_values,
                    items.iter().map(|_| AggState::default()).collect(),
                ));
                groups.len() - 1
            }
        };
        let group = &mut groups[idx];
        for (idx, item) in items.iter().enumerate() {
            if let Expr::FnCall { args, star, .. } = &item.expr {
                let state = &mut group.2[idx];
                if *star {
                    state.count += 1;
                    continue;
                }
                let value = match args.first() {
                    Some(arg) => eval(arg, row, ctx)?,
                    None => CypherValue::null(),
                };
                if value.is_null() {
                    continue;
                }
                state.count += 1;
                if let CypherValue::Value(scalar) = &value {
                    if let Some(n) = numeric(scalar) {
                        state.sum += n;
                        state.seen += 1;
                    }
                    let keep_min = state
                        .min
                        .as_ref()
                        .map(|m| compare(scalar, m) == Some(std::cmp::Ordering::Less))
                        .unwrap_or(true);
                    if keep_min {
                        state.min = Some(scalar.clone());
                    }
                    let keep_max = state
                        .max
                        .as_ref()
                        .map(|m| compare(scalar, m) == Some(std::cmp::Ordering::Greater))
                        .unwrap_or(true);
                    if keep_max {
                        state.max = Some(scalar.clone());
                    }
                }
            }
        }
    }

    // Aggregates over an empty input still produce one row.
    if groups.is_empty() && group_all {
        groups.push((
            Vec::new(),
            Vec::new(),
            items.iter().map(|_| AggState::default()).collect(),
        ));
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, key_values, states) in groups {
        let mut key_iter = key_values.into_iter();
        let mut row_out = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            if item.expr.is_aggregate() {
                let Expr::FnCall { name, .. } = &item.expr else {
                    return Err(NornicError::Syntax(
                        "aggregates cannot be nested in expressions".into(),
                    ));
                };
                let state = &states[idx];
                let value = match name.to_ascii_lowercase().as_str() {
                    "count" => PropertyValue::Int(state.count as i64),
                    "sum" => PropertyValue::Float(state.sum),
                    "avg" => {
                        if state.seen == 0 {
                            PropertyValue::Null
                        } else {
                            PropertyValue::Float(state.sum / state.seen as f64)
                        }
                    }
                    "min" => state.min.clone().unwrap_or(PropertyValue::Null),
                    "max" => state.max.clone().unwrap_or(PropertyValue::Null),
                    other => {
                        return Err(NornicError::Syntax(format!(
                            "unknown aggregate {other}"
                        )))
                    }
                };
                row_out.push(CypherValue::Value(value));
            } else {
                row_out.push(key_iter.next().unwrap_or_else(CypherValue::null));
            }
        }
        out.push(row_out);
    }
    Ok(out)
}

// ---- expression evaluation ----

fn eval(expr: &Expr, row: &Row, ctx: &ExecContext<'_>) -> Result<CypherValue> {
    match expr {
        Expr::Literal(value) => Ok(CypherValue::Value(value.clone())),
        Expr::Param(name) => match ctx.params.get(name) {
            Some(value) => Ok(CypherValue::Value(value.clone())),
            None => Err(NornicError::InvalidRequest(format!(
                "missing parameter ${name}"
            ))),
        },
        Expr::Var(name) => match row.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(NornicError::Syntax(format!("unbound variable {name}"))),
        },
        Expr::Property(base, key) => match eval(base, row, ctx)? {
            CypherValue::Node(node) => Ok(CypherValue::Value(
                node.properties.get(key).cloned().unwrap_or(PropertyValue::Null),
            )),
            CypherValue::Edge(edge) => Ok(CypherValue::Value(
                edge.properties.get(key).cloned().unwrap_or(PropertyValue::Null),
            )),
            CypherValue::Value(PropertyValue::Null) => Ok(CypherValue::null()),
            _ => Err(NornicError::Syntax(format!(
                "cannot read property {key} of a scalar"
            ))),
        },
        Expr::Not(inner) => {
            let value = eval(inner, row, ctx)?;
            Ok(CypherValue::Value(PropertyValue::Bool(!truthy(&value))))
        }
        Expr::And(a, b) => {
            let value = truthy(&eval(a, row, ctx)?) && truthy(&eval(b, row, ctx)?);
            Ok(CypherValue::Value(PropertyValue::Bool(value)))
        }
        Expr::Or(a, b) => {
            let value = truthy(&eval(a, row, ctx)?) || truthy(&eval(b, row, ctx)?);
            Ok(CypherValue::Value(PropertyValue::Bool(value)))
        }
        Expr::Cmp(a, op, b) => {
            let left = scalar_of(eval(a, row, ctx)?)?;
            let right = scalar_of(eval(b, row, ctx)?)?;
            if left.is_null() || right.is_null() {
                return Ok(CypherValue::Value(PropertyValue::Bool(false)));
            }
            let ordering = compare(&left, &right);
            let result = match (op, ordering) {
                (CmpOp::Eq, _) => values_equal(&left, &right),
                (CmpOp::Ne, _) => !values_equal(&left, &right),
                (CmpOp::Lt, Some(o)) => o == std::cmp::Ordering::Less,
                (CmpOp::Le, Some(o)) => o != std::cmp::Ordering::Greater,
                (CmpOp::Gt, Some(o)) => o == std::cmp::Ordering::Greater,
                (CmpOp::Ge, Some(o)) => o != std::cmp::Ordering::Less,
                (_, None) => false,
            };
            Ok(CypherValue::Value(PropertyValue::Bool(result)))
        }
        Expr::IsNull(inner, negated) => {
            let is_null = eval(inner, row, ctx)?.is_null();
            Ok(CypherValue::Value(PropertyValue::Bool(is_null != *negated)))
        }
        Expr::FnCall { name, args, .. } => eval_scalar_fn(name, args, row, ctx),
    }
}

fn eval_scalar_fn(
    name: &str,
    args: &[Expr],
    row: &Row,
    ctx: &ExecContext<'_>,
) -> Result<CypherValue> {
    match name.to_ascii_lowercase().as_str() {
        "id" => match args.first().map(|a| eval(a, row, ctx)).transpose()? {
            Some(CypherValue::Node(n)) => Ok(CypherValue::Value(PropertyValue::Int(n.ordinal as i64))),
            Some(CypherValue::Edge(e)) => Ok(CypherValue::Value(PropertyValue::Int(e.ordinal as i64))),
            _ => Err(NornicError::Syntax("id() expects an entity".into())),
        },
        "elementid" => match args.first().map(|a| eval(a, row, ctx)).transpose()? {
            Some(CypherValue::Node(n)) => Ok(CypherValue::Value(PropertyValue::String(n.id))),
            Some(CypherValue::Edge(e)) => Ok(CypherValue::Value(PropertyValue::String(e.id))),
            _ => Err(NornicError::Syntax("elementId() expects an entity".into())),
        },
        "labels" => match args.first().map(|a| eval(a, row, ctx)).transpose()? {
            Some(CypherValue::Node(n)) => Ok(CypherValue::Value(PropertyValue::List(
                n.labels.into_iter().map(PropertyValue::String).collect(),
            ))),
            _ => Err(NornicError::Syntax("labels() expects a node".into())),
        },
        "type" => match args.first().map(|a| eval(a, row, ctx)).transpose()? {
            Some(CypherValue::Edge(e)) => {
                Ok(CypherValue::Value(PropertyValue::String(e.edge_type)))
            }
            _ => Err(NornicError::Syntax("type() expects a relationship".into())),
        },
        "timestamp" => Ok(CypherValue::Value(PropertyValue::Int(now_millis()))),
        "count" | "sum" | "avg" | "min" | "max" => Err(NornicError::Syntax(format!(
            "aggregate {name}() is only allowed in RETURN"
        ))),
        other => Err(NornicError::Syntax(format!("unknown function {other}()"))),
    }
}

fn scalar_of(value: CypherValue) -> Result<PropertyValue> {
    match value {
        CypherValue::Value(v) => Ok(v),
        _ => Err(NornicError::Syntax(
            "expected a scalar value, found an entity".into(),
        )),
    }
}

fn truthy(value: &CypherValue) -> bool {
    match value {
        CypherValue::Value(PropertyValue::Bool(b)) => *b,
        CypherValue::Value(PropertyValue::Null) => false,
        CypherValue::Value(_) => true,
        _ => true,
    }
}

fn numeric(value: &PropertyValue) -> Option<f64> {
    match value {
        PropertyValue::Int(i) => Some(*i as f64),
        PropertyValue::Float(f) => Some(*f),
        _ => None,
    }
}

/// Equality with numeric cross-type comparison (`1 = 1.0`).
fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x == y;
    }
    a == b
}

fn compare(a: &PropertyValue, b: &PropertyValue) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (PropertyValue::String(x), PropertyValue::String(y)) => Some(x.cmp(y)),
        (PropertyValue::Bool(x), PropertyValue::Bool(y)) => Some(x.cmp(y)),
        (PropertyValue::Timestamp(x), PropertyValue::Timestamp(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
