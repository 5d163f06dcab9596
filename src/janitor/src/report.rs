//! Summary of one cleanup pass.

use crate::matcher::Pattern;
use crate::reclaim::{OsFailure, StepOutcome};
use serde::Serialize;

/// Outcomes of the three reclaimers for one orphan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCleanup {
    pub pattern: Pattern,
    pub database: StepOutcome,
    pub process: StepOutcome,
    pub filesystem: StepOutcome,
}

impl OrphanCleanup {
    pub fn failures(&self) -> impl Iterator<Item = &OsFailure> {
        [&self.database, &self.process, &self.filesystem]
            .into_iter()
            .filter_map(StepOutcome::failure)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub dry_run: bool,
    /// Done builds whose pid was still alive and got killed.
    pub stale_pids_killed: usize,
    /// Done builds whose pid had already exited and was cleared.
    pub stale_pids_cleared: usize,
    pub orphans: Vec<String>,
    pub databases_dropped: usize,
    pub processes_killed: usize,
    pub paths_removed: usize,
    pub failures: Vec<OsFailure>,
    pub duration_ms: u64,
}

impl PassReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn record(&mut self, cleanup: &OrphanCleanup) {
        self.orphans.push(cleanup.pattern.to_string());
        self.databases_dropped += cleanup.database.reclaimed();
        self.processes_killed += cleanup.process.reclaimed();
        self.paths_removed += cleanup.filesystem.reclaimed();
        self.failures.extend(cleanup.failures().cloned());
    }

    /// Total number of resources deleted during the pass.
    pub fn total_reclaimed(&self) -> usize {
        self.stale_pids_killed
            + self.stale_pids_cleared
            + self.databases_dropped
            + self.processes_killed
            + self.paths_removed
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn log(&self) {
        tracing::info!(
            dry_run = self.dry_run,
            stale_pids_killed = self.stale_pids_killed,
            stale_pids_cleared = self.stale_pids_cleared,
            orphans = self.orphans.len(),
            databases_dropped = self.databases_dropped,
            processes_killed = self.processes_killed,
            paths_removed = self.paths_removed,
            failures = self.failures.len(),
            duration_ms = self.duration_ms,
            "Cleanup pass complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::Step;

    #[test]
    fn test_record_accumulates_outcomes() {
        let mut report = PassReport::new(false);
        report.record(&OrphanCleanup {
            pattern: Pattern::new("pr-12"),
            database: StepOutcome::Reclaimed(2),
            process: StepOutcome::NotFound,
            filesystem: StepOutcome::Failed {
                reclaimed: 1,
                failure: OsFailure {
                    pattern: "pr-12".to_string(),
                    step: Step::Filesystem,
                    message: "permission denied".to_string(),
                },
            },
        });
        report.record(&OrphanCleanup {
            pattern: Pattern::new("pr-14"),
            database: StepOutcome::NotFound,
            process: StepOutcome::Reclaimed(1),
            filesystem: StepOutcome::Reclaimed(1),
        });

        assert_eq!(report.orphans, vec!["pr-12", "pr-14"]);
        assert_eq!(report.databases_dropped, 2);
        assert_eq!(report.processes_killed, 1);
        assert_eq!(report.paths_removed, 2);
        assert_eq!(report.total_reclaimed(), 5);
        assert!(!report.is_clean());
        assert_eq!(report.failures[0].step, Step::Filesystem);
    }
}
