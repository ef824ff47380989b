//! Bootstrap notices. Computing them never runs a migration.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::{MigrationError, Runner, SchemaVersion, ScopeProvider, ScopeStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// The installed companion release line differs from the newest
    /// registered step.
    VersionMismatch {
        companion: SchemaVersion,
        target: SchemaVersion,
    },
    PendingMigrations {
        scope: String,
        count: usize,
        next: SchemaVersion,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::VersionMismatch { companion, target } => write!(
                f,
                "GatherPress {companion} and driftfix {target} must be the same version"
            ),
            Notice::PendingMigrations { scope, count, next } => write!(
                f,
                "site {scope} has {count} pending migration step{} starting at {next}",
                if *count == 1 { "" } else { "s" }
            ),
        }
    }
}

/// Gather notices for every scope. Scopes whose status cannot be read are
/// logged and skipped.
pub fn collect_notices<P, S>(
    runner: &Runner<S>,
    provider: &P,
    companion_version: Option<&SchemaVersion>,
) -> Result<Vec<Notice>, MigrationError>
where
    S: ScopeStore,
    P: ScopeProvider<Store = S>,
{
    let mut notices = Vec::new();

    if let (Some(companion), Some(target)) = (companion_version, runner.registry().latest_version())
        && !companion.same_release_line(&target)
    {
        notices.push(Notice::VersionMismatch {
            companion: *companion,
            target,
        });
    }

    for scope in provider.scopes()? {
        let status = match provider
            .open(&scope)
            .map_err(MigrationError::from)
            .and_then(|store| runner.status(&scope, &store))
        {
            Ok(status) => status,
            Err(e) => {
                warn!("skipping notices for scope {}: {e}", scope.id);
                continue;
            }
        };

        if let Some(next) = status.next_pending_version() {
            notices.push(Notice::PendingMigrations {
                scope: scope.id.clone(),
                count: status.pending.len(),
                next,
            });
        }
    }

    Ok(notices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_render_for_operators() {
        let mismatch = Notice::VersionMismatch {
            companion: SchemaVersion::new(0, 32, 1),
            target: SchemaVersion::new(0, 33, 0),
        };
        assert_eq!(
            mismatch.to_string(),
            "GatherPress 0.32.1 and driftfix 0.33.0 must be the same version"
        );

        let pending = Notice::PendingMigrations {
            scope: "3".into(),
            count: 1,
            next: SchemaVersion::new(0, 31, 0),
        };
        assert_eq!(
            pending.to_string(),
            "site 3 has 1 pending migration step starting at 0.31.0"
        );
    }

    #[test]
    fn notices_serialize_with_kind_tag() {
        let notice = Notice::PendingMigrations {
            scope: "1".into(),
            count: 2,
            next: SchemaVersion::new(0, 30, 0),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["kind"], "pending_migrations");
        assert_eq!(json["next"], "0.30.0");
    }
}
