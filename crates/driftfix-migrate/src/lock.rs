//! Per-scope mutual exclusion for migration runs.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{MigrationError, Scope, ScopeStore};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Holds a scope's migration lock and releases it when dropped, including
/// on early return or panic.
pub struct ScopeLockGuard<'a, S: ScopeStore + ?Sized> {
    store: &'a S,
    scope: String,
    holder: String,
}

impl<'a, S: ScopeStore + ?Sized> ScopeLockGuard<'a, S> {
    /// Take the lock, polling until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `MigrationError::Locked` when another holder keeps the lock for the
    /// whole timeout; `MigrationError::Store` when the store fails.
    pub fn acquire(
        store: &'a S,
        scope: &Scope,
        holder: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let holder = holder.into();
        let start = Instant::now();

        loop {
            if store.try_lock(&holder)? {
                debug!("migration lock acquired: scope={}, holder={}", scope.id, holder);
                return Ok(Self {
                    store,
                    scope: scope.id.clone(),
                    holder,
                });
            }

            if start.elapsed() >= timeout {
                return Err(MigrationError::Locked {
                    scope: scope.id.clone(),
                });
            }

            std::thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Renew the lock between units of work.
    ///
    /// # Errors
    ///
    /// `MigrationError::Locked` when the lock was taken over in the
    /// meantime; the caller must stop writing to the scope.
    pub fn refresh(&self) -> Result<(), MigrationError> {
        if self.store.refresh_lock(&self.holder)? {
            return Ok(());
        }
        warn!(
            "migration lock for scope {} lost by {}",
            self.scope, self.holder
        );
        Err(MigrationError::Locked {
            scope: self.scope.clone(),
        })
    }
}

impl<S: ScopeStore + ?Sized> Drop for ScopeLockGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(&self.holder) {
            warn!("failed to release migration lock {}: {e}", self.holder);
        }
    }
}
