use serde::Serialize;

use crate::{SchemaVersion, Scope};

/// Read-only view of a scope's migration state.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStatus {
    pub scope: Scope,
    /// `None` when nothing has been applied yet.
    pub applied: Option<SchemaVersion>,
    pub pending: Vec<PendingStep>,
    pub locked: bool,
}

/// A step that has not been applied to a scope yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingStep {
    pub name: String,
    pub version: SchemaVersion,
}

impl ScopeStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_pending_version(&self) -> Option<SchemaVersion> {
        self.pending.first().map(|p| p.version)
    }
}
