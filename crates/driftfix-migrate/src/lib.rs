//! Versioned, idempotent data migrations.
//!
//! A [`Registry`] holds [`Step`] values ordered by [`SchemaVersion`]. A
//! [`Runner`] applies the steps a [`Scope`] has not seen yet, advancing the
//! scope's watermark after every successful step so an interrupted or failed
//! run resumes at the first step that did not complete.
//!
//! Storage is abstracted by [`ScopeStore`]; discovering the scopes of a
//! multi-tenant deployment by [`ScopeProvider`].

pub mod error;
pub mod lock;
pub mod notice;
pub mod registry;
pub mod runner;
pub mod status;
pub mod step;
pub mod store;
pub mod version;

pub use error::MigrationError;
pub use lock::ScopeLockGuard;
pub use notice::{Notice, collect_notices};
pub use registry::{Pending, Registry};
pub use runner::{AppliedStep, NetworkReport, RunReport, Runner, RunnerOptions, ScopeOutcome};
pub use status::{PendingStep, ScopeStatus};
pub use step::{FnStep, Step, step};
pub use store::{Scope, ScopeProvider, ScopeStore};
pub use version::SchemaVersion;
