//! Build registry: the source of truth for which builds are still live.

mod postgres;

pub use postgres::{NewBuild, PgRegistry};

use crate::error::{JanitorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub type BuildId = i64;

/// Lifecycle state of a build. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Testing,
    Running,
    Deathrow,
    Duplicate,
    Done,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Testing => "testing",
            BuildState::Running => "running",
            BuildState::Deathrow => "deathrow",
            BuildState::Duplicate => "duplicate",
            BuildState::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, BuildState::Done)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = JanitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BuildState::Pending),
            "testing" => Ok(BuildState::Testing),
            "running" => Ok(BuildState::Running),
            "deathrow" => Ok(BuildState::Deathrow),
            "duplicate" => Ok(BuildState::Duplicate),
            "done" => Ok(BuildState::Done),
            other => Err(JanitorError::InvalidState(other.to_string())),
        }
    }
}

/// A build as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildId,
    /// Directory name under `build/`, also the database name prefix.
    pub destination: String,
    pub state: BuildState,
    /// OS pid running the build, `None` once reaped.
    pub pid: Option<i32>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePredicate {
    Eq(BuildState),
    Ne(BuildState),
}

impl StatePredicate {
    pub fn matches(&self, state: BuildState) -> bool {
        match self {
            StatePredicate::Eq(expected) => state == *expected,
            StatePredicate::Ne(excluded) => state != *excluded,
        }
    }
}

/// Conjunction of predicates over build records.
///
/// An empty `pid_in` or `destination_in` set matches nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildFilter {
    pub state: Option<StatePredicate>,
    pub pids: Option<Vec<i32>>,
    pub destinations: Option<Vec<String>>,
    pub modified_before: Option<DateTime<Utc>>,
}

impl BuildFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_eq(mut self, state: BuildState) -> Self {
        self.state = Some(StatePredicate::Eq(state));
        self
    }

    pub fn state_ne(mut self, state: BuildState) -> Self {
        self.state = Some(StatePredicate::Ne(state));
        self
    }

    pub fn pid_in(mut self, pids: impl IntoIterator<Item = i32>) -> Self {
        let mut pids: Vec<i32> = pids.into_iter().collect();
        pids.sort_unstable();
        self.pids = Some(pids);
        self
    }

    pub fn destination_in<S: Into<String>>(
        mut self,
        destinations: impl IntoIterator<Item = S>,
    ) -> Self {
        self.destinations = Some(destinations.into_iter().map(Into::into).collect());
        self
    }

    pub fn modified_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.modified_before = Some(cutoff);
        self
    }

    pub fn matches(&self, record: &BuildRecord) -> bool {
        if let Some(predicate) = &self.state {
            if !predicate.matches(record.state) {
                return false;
            }
        }

        if let Some(pids) = &self.pids {
            match record.pid {
                Some(pid) if pids.contains(&pid) => {}
                _ => return false,
            }
        }

        if let Some(destinations) = &self.destinations {
            if !destinations.iter().any(|d| *d == record.destination) {
                return false;
            }
        }

        if let Some(cutoff) = self.modified_before {
            if record.last_modified >= cutoff {
                return false;
            }
        }

        true
    }
}

/// Narrow data-access interface to the build registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn find_builds(&self, filter: &BuildFilter) -> Result<Vec<BuildRecord>>;

    async fn set_state(&self, ids: &[BuildId], state: BuildState) -> Result<()>;

    async fn clear_process_id(&self, id: BuildId) -> Result<()>;

    /// Configured build root; workspaces live under `<root>/build`.
    fn root_path(&self) -> PathBuf;

    /// Drop a database, a missing database is not an error.
    async fn drop_database(&self, name: &str) -> Result<()>;
}
