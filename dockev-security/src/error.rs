use crate::capability::Capability;

/// Errors produced by the permission ledger and its persistence.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SecurityError>;

/// A capability check came back negative.
///
/// This is an ordinary outcome, not a failure of the host: callers fall back
/// or tell the operator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("plugin '{plugin}' lacks the '{capability}' permission")]
pub struct PermissionDenied {
    pub plugin: String,
    pub capability: Capability,
}
