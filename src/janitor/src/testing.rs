//! In-memory collaborators for exercising the engine without a database
//! server or real processes.
//!
//! Only available with the `testing` feature or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! janitor = { path = "../janitor", features = ["testing"] }
//! ```

use crate::database::DatabaseCatalog;
use crate::enumerator::{ProcessHandle, ProcessTable, SignalOutcome};
use crate::error::{JanitorError, Result};
use crate::registry::{BuildFilter, BuildId, BuildRecord, BuildState, Registry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum DropFailure {
    Os(io::ErrorKind),
    Protocol,
}

/// An in-memory database server: database name to owning account.
#[derive(Debug, Default)]
pub struct InMemoryServer {
    databases: RwLock<BTreeMap<String, String>>,
    drop_failures: RwLock<HashMap<String, DropFailure>>,
}

impl InMemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_database(&self, name: &str, owner: &str) {
        self.databases
            .write()
            .insert(name.to_string(), owner.to_string());
    }

    pub fn databases(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    /// Make every drop of `name` fail with an OS error of `kind`.
    pub fn fail_drop(&self, name: &str, kind: io::ErrorKind) {
        self.drop_failures
            .write()
            .insert(name.to_string(), DropFailure::Os(kind));
    }

    /// Make every drop of `name` fail with a client protocol error, which is
    /// not an OS-level failure.
    pub fn fail_drop_with_protocol_error(&self, name: &str) {
        self.drop_failures
            .write()
            .insert(name.to_string(), DropFailure::Protocol);
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        match self.drop_failures.read().get(name).copied() {
            Some(DropFailure::Os(kind)) => Err(JanitorError::io(
                format!("database {name}"),
                io::Error::new(kind, format!("cannot drop {name}")),
            )),
            Some(DropFailure::Protocol) => Err(JanitorError::DropDatabase {
                name: name.to_string(),
                source: sqlx::Error::Protocol(format!("unexpected reply dropping {name}")),
            }),
            None => {
                self.databases.write().remove(name);
                Ok(())
            }
        }
    }
}

/// Catalog view of an [`InMemoryServer`].
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    server: Arc<InMemoryServer>,
}

impl InMemoryCatalog {
    pub fn new(server: Arc<InMemoryServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl DatabaseCatalog for InMemoryCatalog {
    async fn list_owned_databases(&self, owner: &str, excluded: &[String]) -> Result<Vec<String>> {
        Ok(self
            .server
            .databases
            .read()
            .iter()
            .filter(|(name, db_owner)| db_owner.as_str() == owner && !excluded.contains(name))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Registry holding builds in memory and dropping databases on an [`InMemoryServer`].
#[derive(Debug)]
pub struct InMemoryRegistry {
    root: PathBuf,
    builds: RwLock<Vec<BuildRecord>>,
    server: Arc<InMemoryServer>,
}

impl InMemoryRegistry {
    pub fn new(root: impl Into<PathBuf>, server: Arc<InMemoryServer>) -> Self {
        Self {
            root: root.into(),
            builds: RwLock::new(Vec::new()),
            server,
        }
    }

    pub fn insert(&self, destination: &str, state: BuildState, pid: Option<i32>) -> BuildId {
        self.insert_at(destination, state, pid, Utc::now())
    }

    pub fn insert_at(
        &self,
        destination: &str,
        state: BuildState,
        pid: Option<i32>,
        last_modified: DateTime<Utc>,
    ) -> BuildId {
        let mut builds = self.builds.write();
        let id = builds.len() as BuildId + 1;
        builds.push(BuildRecord {
            id,
            destination: destination.to_string(),
            state,
            pid,
            last_modified,
        });
        id
    }

    pub fn get(&self, id: BuildId) -> Option<BuildRecord> {
        self.builds.read().iter().find(|b| b.id == id).cloned()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn find_builds(&self, filter: &BuildFilter) -> Result<Vec<BuildRecord>> {
        Ok(self
            .builds
            .read()
            .iter()
            .filter(|build| filter.matches(build))
            .cloned()
            .collect())
    }

    async fn set_state(&self, ids: &[BuildId], state: BuildState) -> Result<()> {
        let now = Utc::now();
        for build in self.builds.write().iter_mut() {
            if ids.contains(&build.id) {
                build.state = state;
                build.last_modified = now;
            }
        }
        Ok(())
    }

    async fn clear_process_id(&self, id: BuildId) -> Result<()> {
        if let Some(build) = self.builds.write().iter_mut().find(|b| b.id == id) {
            build.pid = None;
            build.last_modified = Utc::now();
        }
        Ok(())
    }

    fn root_path(&self) -> PathBuf {
        self.root.clone()
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.server.drop_database(name)
    }
}

/// Scripted process table.
///
/// Processes stay listed until killed; pids registered as exited are
/// reported alive by `pids()` but vanish when signalled.
#[derive(Debug, Default)]
pub struct FakeProcessTable {
    processes: Mutex<Vec<ProcessHandle>>,
    exited: Mutex<HashSet<i32>>,
    kill_failures: Mutex<HashMap<i32, io::ErrorKind>>,
    killed: Mutex<Vec<i32>>,
}

impl FakeProcessTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn(&self, pid: i32, cmdline: &[&str]) {
        self.processes.lock().push(ProcessHandle::new(pid, cmdline));
    }

    /// A pid that is listed but exits before any signal reaches it.
    pub fn spawn_exiting(&self, pid: i32, cmdline: &[&str]) {
        self.spawn(pid, cmdline);
        self.exited.lock().insert(pid);
    }

    pub fn fail_kill(&self, pid: i32, kind: io::ErrorKind) {
        self.kill_failures.lock().insert(pid, kind);
    }

    /// Pids that received a delivered kill, in order.
    pub fn killed(&self) -> Vec<i32> {
        self.killed.lock().clone()
    }

    pub fn is_alive(&self, pid: i32) -> bool {
        self.processes.lock().iter().any(|p| p.pid == pid)
    }
}

impl ProcessTable for FakeProcessTable {
    fn pids(&self) -> HashSet<i32> {
        self.processes.lock().iter().map(|p| p.pid).collect()
    }

    fn processes(&self) -> Vec<ProcessHandle> {
        self.processes.lock().clone()
    }

    fn kill(&self, pid: i32) -> io::Result<SignalOutcome> {
        if let Some(kind) = self.kill_failures.lock().get(&pid) {
            return Err(io::Error::from(*kind));
        }

        let mut processes = self.processes.lock();
        let Some(index) = processes.iter().position(|p| p.pid == pid) else {
            return Ok(SignalOutcome::NoSuchProcess);
        };
        processes.remove(index);

        if self.exited.lock().remove(&pid) {
            return Ok(SignalOutcome::NoSuchProcess);
        }

        self.killed.lock().push(pid);
        Ok(SignalOutcome::Delivered)
    }
}

/// Captures formatted events emitted while a closure runs.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl LogCapture {
    pub(crate) fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Lines containing `message`.
    pub(crate) fn lines_with(&self, message: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(message))
            .map(str::to_string)
            .collect()
    }
}
