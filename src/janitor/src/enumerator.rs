//! Enumeration of live resources: OS processes and build directories.

use crate::error::{JanitorError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::Path;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// A live OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    /// Full argument list, program name first.
    pub cmdline: Vec<String>,
}

impl ProcessHandle {
    pub fn new(pid: i32, cmdline: &[&str]) -> Self {
        Self {
            pid,
            cmdline: cmdline.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn command_line(&self) -> String {
        self.cmdline.join(" ")
    }
}

/// Result of delivering a kill signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The process exited before the signal was sent.
    NoSuchProcess,
}

/// Access to the OS process table.
pub trait ProcessTable: Send + Sync {
    /// Ids of every process visible to the caller.
    fn pids(&self) -> HashSet<i32>;

    /// Every visible process with its command line.
    fn processes(&self) -> Vec<ProcessHandle>;

    /// Send `SIGKILL` to `pid`.
    fn kill(&self, pid: i32) -> io::Result<SignalOutcome>;
}

/// Process table backed by `sysinfo`, signals delivered through `kill(2)`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh(&self, refresh_kind: ProcessRefreshKind) -> parking_lot::MutexGuard<'_, System> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind);
        system
    }
}

impl ProcessTable for SystemProcessTable {
    fn pids(&self) -> HashSet<i32> {
        let system = self.refresh(ProcessRefreshKind::nothing());
        system
            .processes()
            .iter()
            .filter(|(_, process)| is_process(process))
            .filter_map(|(pid, _)| i32::try_from(pid.as_u32()).ok())
            .collect()
    }

    fn processes(&self) -> Vec<ProcessHandle> {
        let system = self.refresh(ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always));
        system
            .processes()
            .iter()
            .filter(|(_, process)| is_process(process))
            .filter_map(|(pid, process)| {
                let pid = i32::try_from(pid.as_u32()).ok()?;
                let cmdline = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect();
                Some(ProcessHandle { pid, cmdline })
            })
            .collect()
    }

    fn kill(&self, pid: i32) -> io::Result<SignalOutcome> {
        // kill(2) treats 0 and negative ids as process groups
        if pid <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {pid}"),
            ));
        }

        if u32::try_from(pid).is_ok_and(|pid| pid == std::process::id()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to signal the janitor itself",
            ));
        }

        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => Ok(SignalOutcome::NoSuchProcess),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

/// Linux lists every task of a thread group next to its leader, each carrying
/// the leader's command line. Only leaders are processes.
fn is_process(process: &sysinfo::Process) -> bool {
    process.thread_kind().is_none()
}

/// Names of the build workspaces under `<root>/build`.
///
/// Returns `None` when the build directory does not exist yet, meaning no
/// build has ever run. Only directories are listed.
pub fn list_build_directories(root: &Path) -> Result<Option<BTreeSet<String>>> {
    let build_root = root.join("build");
    let entries = match std::fs::read_dir(&build_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(JanitorError::io(build_root, e)),
    };

    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| JanitorError::io(&build_root, e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| JanitorError::io(entry.path(), e))?;
        if !file_type.is_dir() {
            continue;
        }

        match entry.file_name().into_string() {
            Ok(name) => {
                names.insert(name);
            }
            Err(name) => {
                tracing::warn!(
                    name = %name.to_string_lossy(),
                    "Skipping build directory with non UTF-8 name"
                );
            }
        }
    }

    Ok(Some(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_build_root_is_none() {
        let root = TempDir::new().unwrap();
        assert_eq!(list_build_directories(root.path()).unwrap(), None);
    }

    #[test]
    fn test_lists_only_directories() {
        let root = TempDir::new().unwrap();
        let build = root.path().join("build");
        fs::create_dir_all(build.join("pr-12")).unwrap();
        fs::create_dir_all(build.join("pr-13/logs")).unwrap();
        fs::write(build.join("stray.txt"), "x").unwrap();

        let names = list_build_directories(root.path()).unwrap().unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["pr-12".to_string(), "pr-13".to_string()]
        );
    }

    #[test]
    fn test_empty_build_root_is_empty_set() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("build")).unwrap();
        let names = list_build_directories(root.path()).unwrap().unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn test_command_line_joined_with_spaces() {
        let process = ProcessHandle::new(42, &["odoo", "-d", "pr-12", "--workers=2"]);
        assert_eq!(process.command_line(), "odoo -d pr-12 --workers=2");
    }

    #[test]
    fn test_system_table_sees_current_process() {
        let table = SystemProcessTable::new();
        let me = std::process::id() as i32;
        assert!(table.pids().contains(&me));
        assert!(table.processes().iter().any(|p| p.pid == me));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_threads_are_not_listed_as_processes() {
        use std::sync::{Arc, Barrier};

        let barrier = Arc::new(Barrier::new(4));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    barrier.wait();
                })
            })
            .collect();
        barrier.wait();

        let me = std::process::id() as i32;
        let tasks: HashSet<i32> = fs::read_dir("/proc/self/task")
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().parse().unwrap())
            .collect();
        assert!(tasks.len() >= 4);

        let table = SystemProcessTable::new();
        let pids = table.pids();
        let in_group: Vec<_> = table
            .processes()
            .into_iter()
            .filter(|p| tasks.contains(&p.pid))
            .map(|p| p.pid)
            .collect();

        barrier.wait();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(in_group, vec![me]);
        assert!(pids.contains(&me));
        for tid in tasks.iter().filter(|tid| **tid != me) {
            assert!(!pids.contains(tid), "thread {tid} listed as a process");
        }
    }

    #[test]
    fn test_kill_refuses_group_and_self() {
        let table = SystemProcessTable::new();
        assert!(table.kill(0).is_err());
        assert!(table.kill(-1).is_err());
        assert!(table.kill(std::process::id() as i32).is_err());
    }

    #[test]
    fn test_kill_reports_exited_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let table = SystemProcessTable::new();
        assert_eq!(table.kill(pid).unwrap(), SignalOutcome::NoSuchProcess);
    }

    #[test]
    fn test_kill_running_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let table = SystemProcessTable::new();
        assert_eq!(
            table.kill(child.id() as i32).unwrap(),
            SignalOutcome::Delivered
        );
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
