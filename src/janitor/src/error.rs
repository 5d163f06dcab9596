use std::io;
use std::path::PathBuf;

/// Errors raised by the reconciliation engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum JanitorError {
    #[error("Registry query failed: {0}")]
    Registry(#[source] sqlx::Error),
    #[error("Database catalog query failed: {0}")]
    Catalog(#[source] sqlx::Error),
    #[error("Failed to drop database {name}: {source}")]
    DropDatabase {
        name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },
    #[error("Invalid build state '{0}'")]
    InvalidState(String),
    #[error("Cannot resolve database owner: {0}")]
    Identity(String),
}

pub type Result<T, E = JanitorError> = std::result::Result<T, E>;

/// How a failure is treated by the per-step isolation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The resource is already gone.
    NotFound,
    /// Operating-system or database-server failure, isolated to one step.
    OsLevel,
    /// Anything else aborts the pass.
    Unexpected,
}

impl JanitorError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source, .. } | Self::Signal { source, .. } => {
                if source.kind() == io::ErrorKind::NotFound {
                    ErrorClass::NotFound
                } else {
                    ErrorClass::OsLevel
                }
            }
            Self::Registry(source) | Self::Catalog(source) => classify_sqlx(source),
            Self::DropDatabase { source, .. } => classify_sqlx(source),
            Self::InvalidState(_) | Self::Identity(_) => ErrorClass::Unexpected,
        }
    }
}

/// SQLSTATE `invalid_catalog_name`, raised for a database that does not exist.
const INVALID_CATALOG_NAME: &str = "3D000";

fn classify_sqlx(error: &sqlx::Error) -> ErrorClass {
    match error {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(INVALID_CATALOG_NAME) => {
            ErrorClass::NotFound
        }
        sqlx::Error::Database(_)
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::OsLevel,
        _ => ErrorClass::Unexpected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_not_found() {
        let err = JanitorError::io(
            "/srv/runbot/build/pr-12",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_permission_denied_is_os_level() {
        let err = JanitorError::io(
            "/srv/runbot/build/pr-12",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.class(), ErrorClass::OsLevel);
        assert!(err.to_string().contains("/srv/runbot/build/pr-12"));
    }

    #[test]
    fn test_database_connectivity_is_os_level() {
        let err = JanitorError::DropDatabase {
            name: "pr-12-all".to_string(),
            source: sqlx::Error::PoolTimedOut,
        };
        assert_eq!(err.class(), ErrorClass::OsLevel);

        let err = JanitorError::Catalog(sqlx::Error::Io(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        )));
        assert_eq!(err.class(), ErrorClass::OsLevel);
    }

    #[test]
    fn test_programmer_errors_are_unexpected() {
        assert_eq!(
            JanitorError::InvalidState("zombie".to_string()).class(),
            ErrorClass::Unexpected
        );
        assert_eq!(
            JanitorError::Registry(sqlx::Error::RowNotFound).class(),
            ErrorClass::Unexpected
        );
        assert_eq!(
            JanitorError::Registry(sqlx::Error::ColumnNotFound("pid".to_string())).class(),
            ErrorClass::Unexpected
        );
    }
}
