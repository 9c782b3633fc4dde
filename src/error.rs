//! Crate-wide error taxonomy.
//!
//! Every operation exposed across a component boundary (store, policy
//! engine, capability engine, audit log) returns [`CoreError`] rather than
//! a bare `anyhow::Error`. Helper code that never crosses such a boundary
//! may still reach for `anyhow` the way the rest of this crate's lineage
//! does.

use thiserror::Error;

/// The externally visible error taxonomy (spec §6.4), plus the internal
/// categories needed to report storage and audit failures (§7).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("capability not found: {0}")]
    CapNotFound(String),

    #[error("capability expired at {expires_at}")]
    CapExpired { expires_at: i64 },

    #[error("signature does not verify")]
    InvalidSignature,

    #[error("usage limit exceeded: {used}/{max}")]
    UsageLimitExceeded { used: u64, max: u64 },

    #[error("constraint violation on field {field}: {reason}")]
    ConstraintViolation { field: String, reason: String },

    #[error("capability revoked: {reason}")]
    Revoked { reason: String },

    #[error("denied by policy: {reasoning}")]
    PolicyDenied { reasoning: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("duplicate capability id: {0}")]
    DuplicateId(String),

    #[error("store persistence failure: {0}")]
    StorePersistence(String),

    #[error("store is corrupted: {0}")]
    StoreCorrupt(String),

    #[error("policy load failure in {file}: {reason}")]
    PolicyLoad { file: String, reason: String },

    #[error("audit write failure: {0}")]
    AuditWrite(String),

    #[error("audit log is degraded and cannot accept further writes")]
    AuditDegraded,

    #[error("key material failure: {0}")]
    KeyMaterial(String),

    #[error("configuration or bootstrap failure: {0}")]
    Bootstrap(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// The stable wire code named in spec §6.4, for callers (the IPC layer)
    /// that need to map errors onto a small closed set of strings.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::CapNotFound(_) => "CAP_NOT_FOUND",
            CoreError::CapExpired { .. } => "CAP_EXPIRED",
            CoreError::InvalidSignature => "INVALID_SIGNATURE",
            CoreError::UsageLimitExceeded { .. } => "USAGE_LIMIT_EXCEEDED",
            CoreError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            CoreError::Revoked { .. } => "REVOKED",
            CoreError::PolicyDenied { .. } => "POLICY_DENIED",
            CoreError::InvalidRequest(_) => "INVALID_REQUEST",
            CoreError::DuplicateId(_) => "DUPLICATE_ID",
            CoreError::StorePersistence(_) | CoreError::StoreCorrupt(_) => "STORE_ERROR",
            CoreError::PolicyLoad { .. } => "POLICY_LOAD_ERROR",
            CoreError::AuditWrite(_) | CoreError::AuditDegraded => "AUDIT_ERROR",
            CoreError::KeyMaterial(_) => "KEY_ERROR",
            CoreError::Bootstrap(_) => "BOOTSTRAP_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
