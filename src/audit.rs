//! Structured audit channel.
//!
//! Audit records are tracing events on the dedicated `audit` target, so an
//! operator can route them to their own sink with an `EnvFilter` directive
//! like `audit=info` without touching application logging.

pub const AUDIT_TARGET: &str = "audit";

pub fn auth_event(username: &str, action: &str, success: bool) {
    tracing::info!(
        target: "audit",
        kind = "auth",
        username,
        action,
        success,
        "auth event"
    );
}

pub fn constraint_violation(constraint: &str, label: &str, offending_id: Option<&str>) {
    tracing::warn!(
        target: "audit",
        kind = "constraint",
        constraint,
        label,
        offending_id,
        "constraint violation"
    );
}

pub fn gdpr_operation(operation: &str, subject: &str, actor: &str, affected: usize) {
    tracing::info!(
        target: "audit",
        kind = "gdpr",
        operation,
        subject,
        actor,
        affected,
        "gdpr operation"
    );
}

pub fn admin_mutation(actor: &str, operation: &str, detail: &str) {
    tracing::info!(
        target: "audit",
        kind = "admin",
        actor,
        operation,
        detail,
        "admin mutation"
    );
}
