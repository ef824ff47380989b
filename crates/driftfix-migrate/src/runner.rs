//! Migration runner: applies pending steps to a scope and tracks its
//! watermark.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use driftfix_common::Error;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::status::{PendingStep, ScopeStatus};
use crate::{
    MigrationError, Registry, SchemaVersion, Scope, ScopeLockGuard, ScopeProvider, ScopeStore,
    Step,
};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// How long `run` waits for a concurrent run on the same scope.
    pub lock_timeout: Duration,
    /// Prefix of the lock holder id; a per-run counter is appended. Must be
    /// unique among processes sharing the database.
    pub holder_prefix: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            holder_prefix: format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }
}

/// Result of a drained run on one scope.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scope: Scope,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub applied: Vec<AppliedStep>,
}

impl RunReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedStep {
    pub name: String,
    pub version: SchemaVersion,
    pub elapsed_ms: u64,
}

/// Outcome of one scope in a multi-scope run.
#[derive(Debug)]
pub struct ScopeOutcome {
    pub scope: Scope,
    pub result: Result<RunReport, MigrationError>,
}

/// Per-scope results of a multi-scope run. Partial success is representable.
#[derive(Debug, Default)]
pub struct NetworkReport {
    pub outcomes: Vec<ScopeOutcome>,
}

impl NetworkReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &RunReport> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Scope, &MigrationError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.scope, e)))
    }
}

/// Applies registered steps to scopes.
///
/// The runner performs no authorization; trigger adapters check the caller
/// before invoking it.
pub struct Runner<S: ScopeStore> {
    registry: Arc<Registry<S>>,
    options: RunnerOptions,
    runs: AtomicU64,
}

impl<S: ScopeStore> Runner<S> {
    pub fn new(registry: Arc<Registry<S>>, options: RunnerOptions) -> Self {
        Self {
            registry,
            options,
            runs: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    fn next_holder(&self) -> String {
        let n = self.runs.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.options.holder_prefix, n)
    }

    /// Apply every pending step to `scope`, in version order.
    ///
    /// The watermark advances after each step, so a failure leaves it at the
    /// last step that succeeded and a later run resumes from the failed step.
    /// Steps sharing a version advance the watermark together once the last
    /// of them succeeds.
    ///
    /// # Errors
    ///
    /// `Locked` if another run keeps the scope, `StepFailed` for the first
    /// failing step, `Store` if the watermark cannot be read or written.
    pub fn run(&self, scope: &Scope, store: &S) -> Result<RunReport, MigrationError> {
        let lock = ScopeLockGuard::acquire(
            store,
            scope,
            self.next_holder(),
            self.options.lock_timeout,
        )?;

        let from = store.applied_version()?.unwrap_or(SchemaVersion::ZERO);
        let mut report = RunReport {
            scope: scope.clone(),
            from,
            to: from,
            applied: Vec::new(),
        };

        let mut pending = self.registry.pending(&from).peekable();
        if pending.peek().is_none() {
            info!("scope {} is up to date at {}", scope.id, from);
            return Ok(report);
        }

        while let Some(step) = pending.next() {
            let started = Instant::now();
            info!(
                "applying step '{}' ({}) to scope {}",
                step.name(),
                step.version(),
                scope.id
            );

            self.apply_step(scope, store, step)?;
            // A run that lost its lock must not move the watermark.
            lock.refresh()?;

            let group_done = pending
                .peek()
                .is_none_or(|next| next.version() != step.version());
            if group_done {
                store.record_applied(step.version())?;
                report.to = *step.version();
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(
                "step '{}' applied to scope {} in {}ms",
                step.name(),
                scope.id,
                elapsed_ms
            );
            report.applied.push(AppliedStep {
                name: step.name().to_string(),
                version: *step.version(),
                elapsed_ms,
            });
        }

        info!(
            "scope {} migrated from {} to {} ({} steps)",
            scope.id,
            report.from,
            report.to,
            report.applied.len()
        );
        Ok(report)
    }

    /// Run a single registered step by name, ignoring the watermark.
    /// The watermark is left untouched.
    pub fn run_step(
        &self,
        scope: &Scope,
        store: &S,
        name: &str,
    ) -> Result<AppliedStep, MigrationError> {
        let step = self
            .registry
            .get(name)
            .ok_or_else(|| MigrationError::UnknownStep(name.to_string()))?;

        let _lock = ScopeLockGuard::acquire(
            store,
            scope,
            self.next_holder(),
            self.options.lock_timeout,
        )?;

        let started = Instant::now();
        info!("running step '{}' on scope {} on demand", name, scope.id);
        self.apply_step(scope, store, step)?;

        Ok(AppliedStep {
            name: step.name().to_string(),
            version: *step.version(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Forget the scope's watermark so every step is pending again.
    pub fn reset(&self, scope: &Scope, store: &S) -> Result<(), MigrationError> {
        let _lock = ScopeLockGuard::acquire(
            store,
            scope,
            self.next_holder(),
            self.options.lock_timeout,
        )?;
        store.clear_applied()?;
        info!("watermark cleared for scope {}", scope.id);
        Ok(())
    }

    pub fn status(&self, scope: &Scope, store: &S) -> Result<ScopeStatus, MigrationError> {
        let applied = store.applied_version()?;
        let pending = self
            .registry
            .pending(&applied.unwrap_or(SchemaVersion::ZERO))
            .map(|step| PendingStep {
                name: step.name().to_string(),
                version: *step.version(),
            })
            .collect();

        Ok(ScopeStatus {
            scope: scope.clone(),
            applied,
            pending,
            locked: store.is_locked()?,
        })
    }

    fn apply_step(
        &self,
        scope: &Scope,
        store: &S,
        step: &dyn Step<S>,
    ) -> Result<(), MigrationError> {
        let result = if step.transactional() {
            store.transaction(&mut || step.apply(store))
        } else {
            step.apply(store)
        };

        result.map_err(|cause| {
            error!(
                "step '{}' ({}) failed for scope {}: {}",
                step.name(),
                step.version(),
                scope.id,
                cause
            );
            MigrationError::StepFailed {
                scope: scope.id.clone(),
                step: step.name().to_string(),
                version: *step.version(),
                cause,
            }
        })
    }

    /// Run every scope the provider knows, one after another. A scope that
    /// fails to open or migrate does not stop the others.
    pub fn run_network<P>(&self, provider: &P) -> Result<NetworkReport, MigrationError>
    where
        P: ScopeProvider<Store = S>,
    {
        let scopes = provider.scopes()?;
        Ok(self.run_scopes(provider, &scopes))
    }

    /// Run the given scopes sequentially.
    pub fn run_scopes<P>(&self, provider: &P, scopes: &[Scope]) -> NetworkReport
    where
        P: ScopeProvider<Store = S>,
    {
        let outcomes = scopes
            .iter()
            .map(|scope| ScopeOutcome {
                scope: scope.clone(),
                result: self.run_provided(provider, scope),
            })
            .collect();
        log_network(NetworkReport { outcomes })
    }

    fn run_provided<P>(&self, provider: &P, scope: &Scope) -> Result<RunReport, MigrationError>
    where
        P: ScopeProvider<Store = S>,
    {
        let store = provider.open(scope)?;
        self.run(scope, &store)
    }
}

impl<S: ScopeStore> Runner<S> {
    /// Like [`run_network`](Self::run_network) but each scope runs on its
    /// own thread. Scopes share nothing except the provider.
    pub fn run_network_parallel<P>(&self, provider: &P) -> Result<NetworkReport, MigrationError>
    where
        P: ScopeProvider<Store = S> + Sync,
        S: 'static,
    {
        let scopes = provider.scopes()?;

        let outcomes = std::thread::scope(|threads| {
            let handles: Vec<_> = scopes
                .iter()
                .map(|scope| {
                    let handle = threads.spawn(move || self.run_provided(provider, scope));
                    (scope, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(scope, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(MigrationError::Store(Error::Migration(format!(
                            "migration thread for scope {} panicked",
                            scope.id
                        ))))
                    });
                    ScopeOutcome {
                        scope: scope.clone(),
                        result,
                    }
                })
                .collect()
        });

        Ok(log_network(NetworkReport { outcomes }))
    }
}

fn log_network(report: NetworkReport) -> NetworkReport {
    let failed = report.failed().count();
    if failed == 0 {
        info!("all {} scopes migrated", report.outcomes.len());
    } else {
        for (scope, err) in report.failed() {
            warn!("scope {} not migrated: {}", scope.id, err);
        }
        warn!(
            "{} of {} scopes failed to migrate",
            failed,
            report.outcomes.len()
        );
    }
    report
}
