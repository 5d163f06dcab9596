//! Per-domain deletion routines for the resources of an orphaned build.
//!
//! Each reclaimer returns a tagged [`StepOutcome`]. Operating-system and
//! database-server failures are folded into the outcome so the engine can log
//! them and move on; anything else is returned as an error and aborts the pass.

mod database;
mod filesystem;
mod process;

pub use database::DatabaseReclaimer;
pub use filesystem::FilesystemReclaimer;
pub use process::ProcessReclaimer;

use crate::error::{ErrorClass, JanitorError, Result};
use crate::matcher::Pattern;
use serde::Serialize;
use std::fmt;

/// Resource domain handled by a reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Database,
    Process,
    Filesystem,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Database => "database",
            Step::Process => "process",
            Step::Filesystem => "filesystem",
        };
        f.write_str(s)
    }
}

/// An OS-level failure isolated to one reclaimer step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsFailure {
    pub pattern: String,
    pub step: Step,
    pub message: String,
}

/// Tagged result of one reclaimer step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Resources deleted (or, in dry-run mode, that would have been).
    Reclaimed(usize),
    /// Nothing left to reclaim.
    NotFound,
    /// Some deletions failed with an OS-level error.
    Failed {
        reclaimed: usize,
        failure: OsFailure,
    },
}

impl StepOutcome {
    pub fn reclaimed(&self) -> usize {
        match self {
            StepOutcome::Reclaimed(count) => *count,
            StepOutcome::NotFound => 0,
            StepOutcome::Failed { reclaimed, .. } => *reclaimed,
        }
    }

    pub fn failure(&self) -> Option<&OsFailure> {
        match self {
            StepOutcome::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Accumulates individual deletions within one step.
///
/// The first OS-level failure is kept for the outcome, later ones are only logged.
#[derive(Debug)]
pub(crate) struct StepTally<'a> {
    pattern: &'a Pattern,
    step: Step,
    reclaimed: usize,
    failure: Option<OsFailure>,
}

impl<'a> StepTally<'a> {
    pub(crate) fn new(pattern: &'a Pattern, step: Step) -> Self {
        Self {
            pattern,
            step,
            reclaimed: 0,
            failure: None,
        }
    }

    pub(crate) fn reclaimed(&mut self) {
        self.reclaimed += 1;
    }

    /// Record a failed deletion. Missing resources are skipped, OS-level
    /// failures are kept, anything else is handed back to the caller.
    pub(crate) fn fail(&mut self, error: JanitorError) -> Result<()> {
        match error.class() {
            ErrorClass::NotFound => {
                tracing::warn!(
                    pattern = %self.pattern,
                    step = %self.step,
                    error = %error,
                    "Resource already gone"
                );
                Ok(())
            }
            ErrorClass::OsLevel => {
                tracing::warn!(
                    pattern = %self.pattern,
                    step = %self.step,
                    error = %error,
                    "Reclamation failed"
                );
                if self.failure.is_none() {
                    self.failure = Some(OsFailure {
                        pattern: self.pattern.to_string(),
                        step: self.step,
                        message: error.to_string(),
                    });
                }
                Ok(())
            }
            ErrorClass::Unexpected => Err(error),
        }
    }

    pub(crate) fn finish(self) -> StepOutcome {
        match self.failure {
            Some(failure) => StepOutcome::Failed {
                reclaimed: self.reclaimed,
                failure,
            },
            None if self.reclaimed == 0 => StepOutcome::NotFound,
            None => StepOutcome::Reclaimed(self.reclaimed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LogCapture;
    use std::io;

    fn denied() -> JanitorError {
        JanitorError::io("/x", io::Error::from(io::ErrorKind::PermissionDenied))
    }

    #[test]
    fn test_empty_tally_is_not_found() {
        let pattern = Pattern::new("pr-12");
        let tally = StepTally::new(&pattern, Step::Filesystem);
        assert_eq!(tally.finish(), StepOutcome::NotFound);
    }

    #[test]
    fn test_tally_counts_and_keeps_first_failure() {
        let pattern = Pattern::new("pr-12");
        let mut tally = StepTally::new(&pattern, Step::Filesystem);
        tally.reclaimed();
        tally.fail(denied()).unwrap();
        tally.fail(JanitorError::io("/y", io::Error::from(io::ErrorKind::Other)))
            .unwrap();
        tally.reclaimed();

        let outcome = tally.finish();
        assert_eq!(outcome.reclaimed(), 2);
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.pattern, "pr-12");
        assert_eq!(failure.step, Step::Filesystem);
        assert!(failure.message.contains("/x"));
    }

    #[test]
    fn test_tally_ignores_missing_resources() {
        let pattern = Pattern::new("pr-12");
        let mut tally = StepTally::new(&pattern, Step::Filesystem);
        tally
            .fail(JanitorError::io("/x", io::Error::from(io::ErrorKind::NotFound)))
            .unwrap();
        assert_eq!(tally.finish(), StepOutcome::NotFound);
    }

    #[test]
    fn test_missing_resource_is_logged_as_warning() {
        let pattern = Pattern::new("pr-12");
        let logs = LogCapture::default();
        logs.run(|| {
            let mut tally = StepTally::new(&pattern, Step::Filesystem);
            tally
                .fail(JanitorError::io("/x", io::Error::from(io::ErrorKind::NotFound)))
                .unwrap();
        });

        let lines = logs.lines_with("Resource already gone");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("WARN"));
    }

    #[test]
    fn test_tally_propagates_unexpected_errors() {
        let pattern = Pattern::new("pr-12");
        let mut tally = StepTally::new(&pattern, Step::Database);
        let result = tally.fail(JanitorError::InvalidState("zombie".to_string()));
        assert!(matches!(result, Err(JanitorError::InvalidState(_))));
    }
}
