//! Runbot Janitor Library
//!
//! Reconciles the build workspaces, database-server databases and OS processes
//! of a runbot host against its build registry, reclaiming whatever belongs to
//! builds the registry no longer tracks.
//!
//! Each pass:
//! - Kills pids still recorded on finished builds
//! - Detects orphaned build directories under `<root>/build`
//! - Drops their databases, kills their processes and removes their files,
//!   keeping a non-empty `logs` directory

pub mod database;
pub mod engine;
pub mod enumerator;
pub mod error;
pub mod matcher;
pub mod reclaim;
pub mod registry;
pub mod report;
pub mod service;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use database::{DatabaseCatalog, PgDatabaseCatalog};
pub use engine::{JanitorContext, PidSweep, ReconciliationEngine};
pub use enumerator::{ProcessHandle, ProcessTable, SignalOutcome, SystemProcessTable};
pub use error::{ErrorClass, JanitorError, Result};
pub use matcher::Pattern;
pub use reclaim::{OsFailure, Step, StepOutcome};
pub use registry::{BuildFilter, BuildRecord, BuildState, PgRegistry, Registry};
pub use report::{OrphanCleanup, PassReport};
pub use service::JanitorService;
