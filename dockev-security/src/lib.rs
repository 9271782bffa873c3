pub mod audit;
pub mod capability;
pub mod error;
pub mod permission;
pub mod store;

// Re-export key types for convenience.
pub use audit::{AuditEntry, AuditLog};
pub use capability::{Capability, GrantState};
pub use error::{PermissionDenied, Result, SecurityError};
pub use permission::{
    AutoDeny, Decision, DecisionProvider, GrantRecord, PermissionGate, PermissionLedger,
    ScopedPermissions, ScriptedDecisions, UndeclaredPolicy,
};
pub use store::{JsonLedgerStore, LedgerStore, PersistedGrant};
