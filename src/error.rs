use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NornicError>;

/// Crate-wide error type. Variants map onto the Neo4j status-code catalog at
/// the HTTP boundary via [`NornicError::neo4j_code`].
#[derive(Debug, Error)]
pub enum NornicError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("constraint violation ({kind} on :{label}({properties})): {message}")]
    ConstraintViolation {
        kind: String,
        label: String,
        properties: String,
        offending_id: Option<String>,
        message: String,
    },
    #[error("schema mismatch on :{label}.{property}: {message}")]
    SchemaMismatch {
        label: String,
        property: String,
        message: String,
    },
    #[error("no such constraint: {0}")]
    UnknownConstraint(String),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("transaction {0} not found or expired")]
    UnknownTransaction(String),
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl NornicError {
    pub fn constraint(
        kind: &str,
        label: &str,
        properties: &[String],
        offending_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        NornicError::ConstraintViolation {
            kind: kind.to_string(),
            label: label.to_string(),
            properties: properties.join(", "),
            offending_id,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        NornicError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Status code string in the `Neo.ClientError.*` / `Neo.DatabaseError.*`
    /// catalog understood by Neo4j HTTP clients.
    pub fn neo4j_code(&self) -> &'static str {
        match self {
            NornicError::Syntax(_) => "Neo.ClientError.Statement.SyntaxError",
            NornicError::InvalidRequest(_) => "Neo.ClientError.Request.InvalidFormat",
            NornicError::Unauthorized(_) => "Neo.ClientError.Security.Unauthorized",
            NornicError::Forbidden(_) => "Neo.ClientError.Security.Forbidden",
            NornicError::RateLimited { .. } => "Neo.ClientError.Request.TooManyRequests",
            NornicError::NotFound { .. } | NornicError::UnknownTransaction(_) => {
                "Neo.ClientError.Statement.EntityNotFound"
            }
            NornicError::ConstraintViolation { .. } => {
                "Neo.ClientError.Schema.ConstraintViolation"
            }
            NornicError::SchemaMismatch { .. } => "Neo.ClientError.Schema.SchemaMismatch",
            NornicError::UnknownConstraint(_) => "Neo.ClientError.Schema.ConstraintNotFound",
            NornicError::Unavailable(_) => "Neo.TransientError.General.ServiceUnavailable",
            NornicError::Io(_)
            | NornicError::Serialization(_)
            | NornicError::Corruption(_)
            | NornicError::Internal(_) => "Neo.DatabaseError.General.UnknownError",
        }
    }

    /// Natural HTTP status for endpoints that do not wrap errors in the
    /// transaction envelope (admin and extension surfaces).
    pub fn http_status(&self) -> u16 {
        match self {
            NornicError::Syntax(_)
            | NornicError::InvalidRequest(_)
            | NornicError::ConstraintViolation { .. }
            | NornicError::SchemaMismatch { .. } => 400,
            NornicError::Unauthorized(_) => 401,
            NornicError::Forbidden(_) => 403,
            NornicError::NotFound { .. }
            | NornicError::UnknownTransaction(_)
            | NornicError::UnknownConstraint(_) => 404,
            NornicError::RateLimited { .. } => 429,
            NornicError::Unavailable(_) => 503,
            _ => 500,
        }
    }
}
