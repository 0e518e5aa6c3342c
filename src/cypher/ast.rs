//! Abstract syntax for the supported Cypher subset.

use crate::model::{PropertyValue, ValueKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Query(Query),
    CreateConstraint {
        name: Option<String>,
        if_not_exists: bool,
        def: ConstraintDef,
    },
    DropConstraint {
        name: String,
    },
}

/// How a statement is authorized and journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
    Admin,
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::CreateConstraint { .. } | Statement::DropConstraint { .. } => {
                StatementKind::Admin
            }
            Statement::Query(query) => {
                let mutating = query.clauses.iter().any(|c| {
                    matches!(
                        c,
                        Clause::Create { .. }
                            | Clause::Merge { .. }
                            | Clause::Set(_)
                            | Clause::Remove(_)
                            | Clause::Delete { .. }
                    )
                });
                if mutating {
                    StatementKind::Write
                } else {
                    StatementKind::Read
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Match { patterns: Vec<Pattern> },
    Where(Expr),
    Create { patterns: Vec<Pattern> },
    Merge { pattern: Pattern },
    Set(Vec<SetItem>),
    Remove(Vec<RemoveItem>),
    Delete { detach: bool, exprs: Vec<Expr> },
    Return { items: Vec<ReturnItem>, distinct: bool, limit: Option<usize> },
    Call { procedure: String, args: Vec<Expr>, yields: Vec<String> },
}

/// A path pattern of at most one relationship hop.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub start: NodePattern,
    pub hop: Option<(RelPattern, NodePattern)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodePattern {
    pub var: Option<String>,
    pub labels: Vec<String>,
    pub props: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelDir {
    Out,
    In,
    Undirected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelPattern {
    pub var: Option<String>,
    pub rel_type: Option<String>,
    pub props: Vec<(String, Expr)>,
    pub direction: RelDir,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetItem {
    Property { var: String, key: String, value: Expr },
    Label { var: String, label: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoveItem {
    Property { var: String, key: String },
    Label { var: String, label: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl ReturnItem {
    pub fn column_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.expr.display_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(PropertyValue),
    Param(String),
    Var(String),
    Property(Box<Expr>, String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    IsNull(Box<Expr>, bool),
    FnCall { name: String, args: Vec<Expr>, star: bool },
}

impl Expr {
    pub fn display_name(&self) -> String {
        match self {
            Expr::Literal(v) => format!("{v:?}"),
            Expr::Param(p) => format!("${p}"),
            Expr::Var(v) => v.clone(),
            Expr::Property(base, key) => format!("{}.{key}", base.display_name()),
            Expr::Not(inner) => format!("NOT {}", inner.display_name()),
            Expr::And(a, b) => format!("{} AND {}", a.display_name(), b.display_name()),
            Expr::Or(a, b) => format!("{} OR {}", a.display_name(), b.display_name()),
            Expr::Cmp(a, op, b) => {
                let op = match op {
                    CmpOp::Eq => "=",
                    CmpOp::Ne => "<>",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                format!("{} {op} {}", a.display_name(), b.display_name())
            }
            Expr::IsNull(inner, negated) => {
                if *negated {
                    format!("{} IS NOT NULL", inner.display_name())
                } else {
                    format!("{} IS NULL", inner.display_name())
                }
            }
            Expr::FnCall { name, args, star } => {
                if *star {
                    format!("{name}(*)")
                } else {
                    let args: Vec<String> = args.iter().map(|a| a.display_name()).collect();
                    format!("{name}({})", args.join(", "))
                }
            }
        }
    }

    /// True when this expression (or a subexpression) is an aggregate call.
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::FnCall { name, .. } => {
                matches!(name.to_ascii_lowercase().as_str(), "count" | "sum" | "avg" | "min" | "max")
            }
            Expr::Not(e) | Expr::IsNull(e, _) | Expr::Property(e, _) => e.is_aggregate(),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(a, _, b) => {
                a.is_aggregate() || b.is_aggregate()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintDef {
    pub label: String,
    pub properties: Vec<String>,
    pub on_relationship: bool,
    pub flavor: ConstraintFlavor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintFlavor {
    Unique,
    NodeKey,
    Exists,
    PropType(ValueKind),
}
