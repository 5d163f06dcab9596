use super::{BuildFilter, BuildId, BuildRecord, BuildState, Registry, StatePredicate};
use crate::error::{JanitorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, query};
use std::path::PathBuf;

/// Values for registering a build, used by provisioning tools and tests.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub destination: String,
    pub state: BuildState,
    pub pid: Option<i32>,
    /// Defaults to now.
    pub write_date: Option<DateTime<Utc>>,
}

impl NewBuild {
    pub fn new(destination: impl Into<String>, state: BuildState) -> Self {
        Self {
            destination: destination.into(),
            state,
            pid: None,
            write_date: None,
        }
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn written_at(mut self, write_date: DateTime<Utc>) -> Self {
        self.write_date = Some(write_date);
        self
    }
}

/// Registry stored in a PostgreSQL `runbot_build` table.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
    root: PathBuf,
}

impl PgRegistry {
    /// Connect to the registry database and make sure the schema exists.
    pub async fn connect(dsn: &str, root: PathBuf) -> Result<Self> {
        log::info!("Connecting to build registry");

        let pool = PgPool::connect(dsn).await.map_err(|e| {
            log::error!("Failed to connect to build registry: {e}");
            JanitorError::Registry(e)
        })?;

        let registry = Self::from_pool(pool, root);
        registry.init().await?;
        log::info!("Build registry schema initialized");
        Ok(registry)
    }

    pub fn from_pool(pool: PgPool, root: PathBuf) -> Self {
        Self { pool, root }
    }

    /// Create the build table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        let create_builds = r#"
        CREATE TABLE IF NOT EXISTS runbot_build (
            id BIGSERIAL PRIMARY KEY,
            dest TEXT NOT NULL,
            state TEXT NOT NULL,
            pid INTEGER,
            write_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#;
        query(create_builds)
            .execute(&self.pool)
            .await
            .map_err(JanitorError::Registry)?;

        let create_dest_index = r#"
        CREATE INDEX IF NOT EXISTS runbot_build_dest_idx ON runbot_build (dest)"#;
        query(create_dest_index)
            .execute(&self.pool)
            .await
            .map_err(JanitorError::Registry)?;

        Ok(())
    }

    pub async fn insert_build(&self, build: &NewBuild) -> Result<BuildId> {
        let stmt = r#"
        INSERT INTO runbot_build (dest, state, pid, write_date)
        VALUES ($1, $2, $3, COALESCE($4, NOW()))
        RETURNING id
        "#;
        let row = query(stmt)
            .bind(&build.destination)
            .bind(build.state.as_str())
            .bind(build.pid)
            .bind(build.write_date)
            .fetch_one(&self.pool)
            .await
            .map_err(JanitorError::Registry)?;

        row.try_get("id").map_err(JanitorError::Registry)
    }
}

fn record_from_row(row: &PgRow) -> Result<BuildRecord> {
    let state: String = row.try_get("state").map_err(JanitorError::Registry)?;
    Ok(BuildRecord {
        id: row.try_get("id").map_err(JanitorError::Registry)?,
        destination: row.try_get("dest").map_err(JanitorError::Registry)?,
        state: state.parse()?,
        pid: row.try_get("pid").map_err(JanitorError::Registry)?,
        last_modified: row.try_get("write_date").map_err(JanitorError::Registry)?,
    })
}

/// Quote a database name as a PostgreSQL identifier.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl Registry for PgRegistry {
    async fn find_builds(&self, filter: &BuildFilter) -> Result<Vec<BuildRecord>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id, dest, state, pid, write_date FROM runbot_build WHERE TRUE");

        match filter.state {
            Some(StatePredicate::Eq(state)) => {
                builder.push(" AND state = ").push_bind(state.as_str());
            }
            Some(StatePredicate::Ne(state)) => {
                builder.push(" AND state <> ").push_bind(state.as_str());
            }
            None => {}
        }

        if let Some(pids) = &filter.pids {
            builder.push(" AND pid = ANY(").push_bind(pids.clone()).push(")");
        }

        if let Some(destinations) = &filter.destinations {
            builder
                .push(" AND dest = ANY(")
                .push_bind(destinations.clone())
                .push(")");
        }

        if let Some(cutoff) = filter.modified_before {
            builder.push(" AND write_date < ").push_bind(cutoff);
        }

        builder.push(" ORDER BY id");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(JanitorError::Registry)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn set_state(&self, ids: &[BuildId], state: BuildState) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let stmt = r#"
        UPDATE runbot_build SET state = $1, write_date = NOW()
        WHERE id = ANY($2)
        "#;
        query(stmt)
            .bind(state.as_str())
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(JanitorError::Registry)?;

        Ok(())
    }

    async fn clear_process_id(&self, id: BuildId) -> Result<()> {
        let stmt = r#"
        UPDATE runbot_build SET pid = NULL, write_date = NOW()
        WHERE id = $1
        "#;
        query(stmt)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(JanitorError::Registry)?;

        Ok(())
    }

    fn root_path(&self) -> PathBuf {
        self.root.clone()
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        // DROP DATABASE cannot run inside the implicit transaction of a
        // prepared statement, so it goes through the simple query protocol
        let stmt = format!("DROP DATABASE IF EXISTS {}", quote_identifier(name));
        sqlx::raw_sql(&stmt)
            .execute(&self.pool)
            .await
            .map_err(|source| JanitorError::DropDatabase {
                name: name.to_string(),
                source,
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("pr-12-all"), "\"pr-12-all\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_new_build_builder() {
        let build = NewBuild::new("pr-12", BuildState::Running).with_pid(4242);
        assert_eq!(build.destination, "pr-12");
        assert_eq!(build.pid, Some(4242));
        assert!(build.write_date.is_none());
    }
}
