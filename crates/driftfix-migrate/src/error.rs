use driftfix_common::Error;
use thiserror::Error;

use crate::SchemaVersion;

/// Errors raised while registering or running migrations.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A step with this name is already registered. Programmer error,
    /// fatal at startup.
    #[error("step '{name}' is already registered")]
    DuplicateVersion { name: String },

    #[error("invalid schema version: {0:?}")]
    InvalidVersion(String),

    /// A step returned an error. The scope's watermark stays at the last
    /// step that succeeded.
    #[error("step '{step}' ({version}) failed for scope {scope}: {cause}")]
    StepFailed {
        scope: String,
        step: String,
        version: SchemaVersion,
        #[source]
        cause: Error,
    },

    /// Another run holds the scope's migration lock.
    #[error("scope {scope} is locked by another migration run")]
    Locked { scope: String },

    #[error("no step named '{0}' is registered")]
    UnknownStep(String),

    #[error(transparent)]
    Store(#[from] Error),
}

impl MigrationError {
    /// Scope the error belongs to, when it is scope-bound.
    pub fn scope(&self) -> Option<&str> {
        match self {
            MigrationError::StepFailed { scope, .. } | MigrationError::Locked { scope } => {
                Some(scope)
            }
            _ => None,
        }
    }
}
