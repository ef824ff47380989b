use std::fmt;

use driftfix_common::Result;
use serde::Serialize;

use crate::SchemaVersion;

/// An isolated execution and storage boundary with its own watermark, such
/// as one site of a multisite network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Scope {
    /// Stable identifier (the site's blog id).
    pub id: String,
    /// Prefix of the scope's tables, e.g. `wp_` or `wp_3_`.
    pub table_prefix: String,
}

impl Scope {
    pub fn new(id: impl Into<String>, table_prefix: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            table_prefix: table_prefix.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.table_prefix)
    }
}

/// Persistent state the runner needs from a scope: the watermark, the
/// migration lock and, where supported, a transaction boundary.
pub trait ScopeStore {
    /// Highest successfully applied version, `None` if nothing was applied.
    fn applied_version(&self) -> Result<Option<SchemaVersion>>;

    fn record_applied(&self, version: &SchemaVersion) -> Result<()>;

    fn clear_applied(&self) -> Result<()>;

    /// Try once to take the scope's migration lock for `holder`. Returns
    /// `false` when another holder has it.
    fn try_lock(&self, holder: &str) -> Result<bool>;

    /// Mark a held lock as alive so it is not taken over as stale. Returns
    /// `false` when `holder` no longer owns the lock.
    fn refresh_lock(&self, holder: &str) -> Result<bool>;

    /// Release the lock if `holder` still owns it.
    fn unlock(&self, holder: &str) -> Result<()>;

    fn is_locked(&self) -> Result<bool>;

    /// Run `work` atomically. Stores without transactions run it directly
    /// and rely on step idempotency.
    fn transaction(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        work()
    }
}

/// Enumerates the scopes of a deployment and opens a store for each.
pub trait ScopeProvider {
    type Store: ScopeStore;

    fn scopes(&self) -> Result<Vec<Scope>>;

    fn open(&self, scope: &Scope) -> Result<Self::Store>;
}
