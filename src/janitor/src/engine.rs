//! Reconciliation of build directories, processes and databases against the registry.
//!
//! ## Pass algorithm
//!
//! 1. **Stale pid sweep**: kill live pids still recorded on `done` builds,
//!    clearing the ones that already exited
//! 2. **Orphan detection**: directories under `build/` without a non-`done`
//!    registry record
//! 3. **Per-orphan cleanup**: database, process, then filesystem reclaimer,
//!    each isolated from the failures of the others

use crate::database::{self, DatabaseCatalog};
use crate::enumerator::{self, ProcessTable, SignalOutcome};
use crate::error::Result;
use crate::matcher::Pattern;
use crate::reclaim::{DatabaseReclaimer, FilesystemReclaimer, ProcessReclaimer, Step, StepOutcome};
use crate::registry::{BuildFilter, BuildState, Registry};
use crate::report::{OrphanCleanup, PassReport};
use chrono::{TimeDelta, Utc};
use common::config::Configuration;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Execution context fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JanitorContext {
    /// OS account owning the build databases.
    pub owner: String,
    /// Databases never reclaimed.
    pub excluded_databases: Vec<String>,
    pub drop_delay: Duration,
    pub dry_run: bool,
}

impl JanitorContext {
    /// Build the context from configuration, resolving the current OS user
    /// unless an owner is configured.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let owner = match &config.janitor.owner {
            Some(owner) => owner.clone(),
            None => database::current_os_user()?,
        };

        Ok(Self {
            owner,
            excluded_databases: database::excluded_databases(&config.database.template),
            drop_delay: config.database.drop_delay,
            dry_run: config.janitor.dry_run,
        })
    }
}

/// Outcome of the stale pid sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PidSweep {
    pub killed: usize,
    pub cleared: usize,
}

pub struct ReconciliationEngine {
    context: JanitorContext,
    registry: Arc<dyn Registry>,
    processes: Arc<dyn ProcessTable>,
    root: PathBuf,
    database: DatabaseReclaimer,
    process: ProcessReclaimer,
    filesystem: FilesystemReclaimer,
}

impl ReconciliationEngine {
    pub fn new(
        context: JanitorContext,
        registry: Arc<dyn Registry>,
        catalog: Arc<dyn DatabaseCatalog>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        let root = registry.root_path();
        let database = DatabaseReclaimer::new(
            registry.clone(),
            catalog,
            context.owner.clone(),
            context.excluded_databases.clone(),
            context.drop_delay,
            context.dry_run,
        );
        let process = ProcessReclaimer::new(processes.clone(), context.dry_run);
        let filesystem = FilesystemReclaimer::new(root.clone(), context.dry_run);

        Self {
            context,
            registry,
            processes,
            root,
            database,
            process,
            filesystem,
        }
    }

    pub fn context(&self) -> &JanitorContext {
        &self.context
    }

    /// Run one full reconciliation pass.
    ///
    /// OS-level reclaimer failures are logged and reported; registry failures
    /// and unexpected errors abort the pass.
    pub async fn run_cleanup_pass(&self) -> Result<PassReport> {
        let started = Instant::now();
        let mut report = PassReport::new(self.context.dry_run);

        let sweep = self.sweep_stale_pids().await?;
        report.stale_pids_killed = sweep.killed;
        report.stale_pids_cleared = sweep.cleared;

        match self.detect_orphans().await? {
            Some(orphans) => {
                for pattern in &orphans {
                    let cleanup = self.clean_up_orphan(pattern).await?;
                    report.record(&cleanup);
                }
            }
            None => {
                tracing::debug!(
                    root = %self.root.display(),
                    "Build directory does not exist yet, nothing to clean"
                );
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report.log();
        Ok(report)
    }

    /// Kill the pids of `done` builds that are still running.
    ///
    /// A pid that exited before the signal is cleared from its build.
    pub async fn sweep_stale_pids(&self) -> Result<PidSweep> {
        let mut sweep = PidSweep::default();
        let live = self.processes.pids();
        if live.is_empty() {
            return Ok(sweep);
        }

        let filter = BuildFilter::new()
            .state_eq(BuildState::Done)
            .pid_in(live);
        for build in self.registry.find_builds(&filter).await? {
            let Some(pid) = build.pid else {
                continue;
            };

            if self.context.dry_run {
                tracing::info!(
                    build = build.id,
                    destination = %build.destination,
                    pid,
                    "[DRY-RUN] Would kill stale pid"
                );
                sweep.killed += 1;
                continue;
            }

            tracing::debug!(build = build.id, pid, "Killing stale pid");
            match self.processes.kill(pid) {
                Ok(SignalOutcome::Delivered) => {
                    tracing::info!(
                        build = build.id,
                        destination = %build.destination,
                        pid,
                        "Killed stale pid"
                    );
                    sweep.killed += 1;
                }
                Ok(SignalOutcome::NoSuchProcess) => {
                    tracing::warn!(
                        build = build.id,
                        pid,
                        "Could not kill pid, process already exited"
                    );
                    self.registry.clear_process_id(build.id).await?;
                    sweep.cleared += 1;
                }
                Err(e) => {
                    tracing::warn!(build = build.id, pid, error = %e, "Could not kill pid");
                }
            }
        }

        Ok(sweep)
    }

    /// Build directories with no non-`done` registry record.
    ///
    /// `None` when the build directory does not exist.
    pub async fn detect_orphans(&self) -> Result<Option<BTreeSet<Pattern>>> {
        let Some(build_dirs) = enumerator::list_build_directories(&self.root)? else {
            return Ok(None);
        };
        if build_dirs.is_empty() {
            return Ok(Some(BTreeSet::new()));
        }

        let filter = BuildFilter::new()
            .destination_in(build_dirs.iter().cloned())
            .state_ne(BuildState::Done);
        let valid: BTreeSet<String> = self
            .registry
            .find_builds(&filter)
            .await?
            .into_iter()
            .map(|build| build.destination)
            .collect();

        tracing::debug!(build_dirs = ?build_dirs, valid_builds = ?valid, "Computed live builds");

        let orphans = build_dirs
            .difference(&valid)
            .map(|name| Pattern::new(name.as_str()))
            .collect();
        Ok(Some(orphans))
    }

    /// Reclaim databases, processes and files of one orphan, in that order.
    pub async fn clean_up_orphan(&self, pattern: &Pattern) -> Result<OrphanCleanup> {
        tracing::info!(pattern = %pattern, "Cleaning up orphaned build");

        let database = self.database.reclaim(pattern).await?;
        log_step(pattern, Step::Database, &database);

        let process = self.process.reclaim(pattern)?;
        log_step(pattern, Step::Process, &process);

        let filesystem = self.filesystem.reclaim(pattern)?;
        log_step(pattern, Step::Filesystem, &filesystem);

        Ok(OrphanCleanup {
            pattern: pattern.clone(),
            database,
            process,
            filesystem,
        })
    }

    /// Mark every non-`done` build untouched for longer than `window` as `done`.
    ///
    /// Recovers registry entries left behind by a crash; run once at startup.
    pub async fn force_stale_to_done(&self, window: Duration) -> Result<usize> {
        let Some(cutoff) = TimeDelta::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            tracing::warn!(window = ?window, "Staleness window out of range, skipping recovery");
            return Ok(0);
        };

        let filter = BuildFilter::new()
            .state_ne(BuildState::Done)
            .modified_before(cutoff);
        let ids: Vec<_> = self
            .registry
            .find_builds(&filter)
            .await?
            .into_iter()
            .map(|build| build.id)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        if self.context.dry_run {
            tracing::info!(count = ids.len(), "[DRY-RUN] Would mark stale builds as done");
            return Ok(ids.len());
        }

        tracing::info!(count = ids.len(), cutoff = %cutoff, "Marking stale builds as done");
        self.registry.set_state(&ids, BuildState::Done).await?;
        Ok(ids.len())
    }
}

fn log_step(pattern: &Pattern, step: Step, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Reclaimed(count) => {
            tracing::debug!(pattern = %pattern, step = %step, reclaimed = count, "Step complete");
        }
        StepOutcome::NotFound => {
            tracing::debug!(pattern = %pattern, step = %step, "Nothing to reclaim");
        }
        StepOutcome::Failed { reclaimed, failure } => {
            tracing::error!(
                pattern = %pattern,
                step = %step,
                reclaimed,
                error = %failure.message,
                "Error in {step} cleanup"
            );
        }
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("context", &self.context)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
