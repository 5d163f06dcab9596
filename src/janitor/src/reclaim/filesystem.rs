use super::{Step, StepOutcome, StepTally};
use crate::error::{JanitorError, Result};
use crate::matcher::Pattern;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the log directory kept when a build workspace is reclaimed.
pub const LOGS_DIR: &str = "logs";

/// Removes the build workspace `<root>/build/<pattern>`.
///
/// A non-empty `logs` directory is the only forensic record of the build and
/// survives: everything else in the workspace is removed around it.
pub struct FilesystemReclaimer {
    root: PathBuf,
    dry_run: bool,
}

impl FilesystemReclaimer {
    pub fn new(root: PathBuf, dry_run: bool) -> Self {
        Self { root, dry_run }
    }

    pub fn reclaim(&self, pattern: &Pattern) -> Result<StepOutcome> {
        let mut tally = StepTally::new(pattern, Step::Filesystem);
        let path = pattern.build_path(&self.root);

        let keep_logs = match has_logs(&path.join(LOGS_DIR)) {
            Ok(keep_logs) => keep_logs,
            Err(e) => {
                tally.fail(e)?;
                return Ok(tally.finish());
            }
        };

        if keep_logs {
            self.remove_all_but_logs(pattern, &path, &mut tally)?;
        } else {
            self.remove_tree(pattern, &path, &mut tally)?;
        }

        Ok(tally.finish())
    }

    fn remove_all_but_logs(
        &self,
        pattern: &Pattern,
        path: &Path,
        tally: &mut StepTally<'_>,
    ) -> Result<()> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => return tally.fail(JanitorError::io(path, e)),
        };

        let mut removed_here = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tally.fail(JanitorError::io(path, e))?;
                    continue;
                }
            };
            if entry.file_name() == LOGS_DIR {
                continue;
            }

            let entry_path = entry.path();
            if self.dry_run {
                tracing::info!(
                    pattern = %pattern,
                    path = %entry_path.display(),
                    "[DRY-RUN] Would remove path"
                );
                tally.reclaimed();
                removed_here += 1;
                continue;
            }

            let removed = entry.file_type().and_then(|file_type| {
                if file_type.is_dir() {
                    fs::remove_dir_all(&entry_path)
                } else {
                    fs::remove_file(&entry_path)
                }
            });
            match removed {
                Ok(()) => {
                    tracing::debug!(pattern = %pattern, path = %entry_path.display(), "Removed path");
                    tally.reclaimed();
                    removed_here += 1;
                }
                Err(e) => tally.fail(JanitorError::io(entry_path, e))?,
            }
        }

        if removed_here > 0 && !self.dry_run {
            tracing::info!(
                pattern = %pattern,
                path = %path.display(),
                removed = removed_here,
                "Reclaimed build directory, logs preserved"
            );
        }
        Ok(())
    }

    fn remove_tree(&self, pattern: &Pattern, path: &Path, tally: &mut StepTally<'_>) -> Result<()> {
        if self.dry_run {
            if path.is_dir() {
                tracing::info!(
                    pattern = %pattern,
                    path = %path.display(),
                    "[DRY-RUN] Would remove build directory"
                );
                tally.reclaimed();
            }
            return Ok(());
        }

        match fs::remove_dir_all(path) {
            Ok(()) => {
                tracing::info!(pattern = %pattern, path = %path.display(), "Removed build directory");
                tally.reclaimed();
                Ok(())
            }
            Err(e) => tally.fail(JanitorError::io(path, e)),
        }
    }
}

/// Whether `logs` is a directory with at least one entry.
fn has_logs(logs: &Path) -> Result<bool> {
    match fs::read_dir(logs) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(false)
        }
        Err(e) => Err(JanitorError::io(logs, e)),
    }
}
