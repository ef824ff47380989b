use driftfix_common::Result;

use crate::SchemaVersion;

/// One versioned, idempotent unit of migration logic.
///
/// `apply` must be safe to re-run: check whether the target state already
/// exists before mutating, and make batch work resumable through a marker
/// or replace semantics.
pub trait Step<S: ?Sized>: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    fn version(&self) -> &SchemaVersion;

    /// Whether the runner wraps `apply` in the store's transaction. Steps
    /// that commit per batch or call out to the network return `false`.
    fn transactional(&self) -> bool {
        true
    }

    fn apply(&self, store: &S) -> Result<()>;
}

/// A step built from a closure.
pub struct FnStep<S: ?Sized> {
    name: String,
    version: SchemaVersion,
    transactional: bool,
    apply: Box<dyn Fn(&S) -> Result<()> + Send + Sync>,
}

/// Build a transactional step from a closure.
pub fn step<S, F>(name: impl Into<String>, version: SchemaVersion, apply: F) -> FnStep<S>
where
    S: ?Sized,
    F: Fn(&S) -> Result<()> + Send + Sync + 'static,
{
    FnStep {
        name: name.into(),
        version,
        transactional: true,
        apply: Box::new(apply),
    }
}

impl<S: ?Sized> FnStep<S> {
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }
}

impl<S: ?Sized> Step<S> for FnStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &SchemaVersion {
        &self.version
    }

    fn transactional(&self) -> bool {
        self.transactional
    }

    fn apply(&self, store: &S) -> Result<()> {
        (self.apply)(store)
    }
}
