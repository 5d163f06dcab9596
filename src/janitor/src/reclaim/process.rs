use super::{Step, StepOutcome, StepTally};
use crate::enumerator::{ProcessTable, SignalOutcome};
use crate::error::{JanitorError, Result};
use crate::matcher::Pattern;
use std::sync::Arc;

/// Kills every process attached to the pattern's database.
///
/// Fire-and-forget: a delivered `SIGKILL` is counted, death is not verified.
pub struct ProcessReclaimer {
    processes: Arc<dyn ProcessTable>,
    dry_run: bool,
}

impl ProcessReclaimer {
    pub fn new(processes: Arc<dyn ProcessTable>, dry_run: bool) -> Self {
        Self { processes, dry_run }
    }

    pub fn reclaim(&self, pattern: &Pattern) -> Result<StepOutcome> {
        let mut tally = StepTally::new(pattern, Step::Process);

        for process in self.processes.processes() {
            if !pattern.matches_command_line(&process.cmdline) {
                continue;
            }

            if self.dry_run {
                tracing::info!(
                    pattern = %pattern,
                    pid = process.pid,
                    cmdline = %process.command_line(),
                    "[DRY-RUN] Would kill process"
                );
                tally.reclaimed();
                continue;
            }

            tracing::debug!(
                pattern = %pattern,
                pid = process.pid,
                cmdline = %process.command_line(),
                "Killing process"
            );
            match self.processes.kill(process.pid) {
                Ok(SignalOutcome::Delivered) => tally.reclaimed(),
                Ok(SignalOutcome::NoSuchProcess) => {
                    tracing::warn!(pattern = %pattern, pid = process.pid, "Process already exited");
                }
                Err(source) => tally.fail(JanitorError::Signal {
                    pid: process.pid,
                    source,
                })?,
            }
        }

        Ok(tally.finish())
    }
}
