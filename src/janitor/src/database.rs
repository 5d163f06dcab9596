//! Database server catalog access.
//!
//! Build databases are created under the OS account running the builds, not
//! under the account the registry connects with, so listing goes straight to
//! `pg_database` filtered by owner instead of through the registry.

use crate::error::{JanitorError, Result};
use async_trait::async_trait;
use nix::unistd::{User, geteuid};
use sqlx::{PgPool, query_scalar};
use std::collections::BTreeSet;

/// Databases that exist on every server and are never reclaimed.
pub const SYSTEM_DATABASES: [&str; 3] = ["template0", "template1", "postgres"];

/// Sorted names that must never be listed as reclaimable: the system
/// databases plus the template of the active configuration.
pub fn excluded_databases(template: &str) -> Vec<String> {
    SYSTEM_DATABASES
        .iter()
        .copied()
        .chain(std::iter::once(template))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Name of the effective OS account running the janitor.
pub fn current_os_user() -> Result<String> {
    let uid = geteuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(JanitorError::Identity(format!(
            "no passwd entry for uid {uid}"
        ))),
        Err(errno) => Err(JanitorError::Identity(format!(
            "lookup of uid {uid} failed: {errno}"
        ))),
    }
}

/// Lists databases on the server.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    /// Databases owned by `owner`, minus `excluded`, sorted by name.
    async fn list_owned_databases(&self, owner: &str, excluded: &[String]) -> Result<Vec<String>>;
}

/// Catalog reading `pg_database` over a maintenance connection.
#[derive(Clone)]
pub struct PgDatabaseCatalog {
    pool: PgPool,
}

impl PgDatabaseCatalog {
    pub async fn connect(dsn: &str) -> Result<Self> {
        log::info!("Connecting to database server catalog");
        let pool = PgPool::connect(dsn).await.map_err(|e| {
            log::error!("Failed to connect to database server catalog: {e}");
            JanitorError::Catalog(e)
        })?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseCatalog for PgDatabaseCatalog {
    async fn list_owned_databases(&self, owner: &str, excluded: &[String]) -> Result<Vec<String>> {
        let stmt = r#"
        SELECT datname
        FROM pg_database
        WHERE datdba = (
            SELECT usesysid
            FROM pg_user
            WHERE usename::text = $1
        ) AND NOT (datname::text = ANY($2))
        ORDER BY datname
        "#;
        query_scalar::<_, String>(stmt)
            .bind(owner)
            .bind(excluded.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(JanitorError::Catalog)
    }
}
