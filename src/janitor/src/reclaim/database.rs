use super::{Step, StepOutcome, StepTally};
use crate::database::DatabaseCatalog;
use crate::error::Result;
use crate::matcher::Pattern;
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Drops every database owned by the build account whose name starts with the pattern.
pub struct DatabaseReclaimer {
    registry: Arc<dyn Registry>,
    catalog: Arc<dyn DatabaseCatalog>,
    owner: String,
    excluded: Vec<String>,
    drop_delay: Duration,
    dry_run: bool,
}

impl DatabaseReclaimer {
    pub fn new(
        registry: Arc<dyn Registry>,
        catalog: Arc<dyn DatabaseCatalog>,
        owner: String,
        excluded: Vec<String>,
        drop_delay: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            registry,
            catalog,
            owner,
            excluded,
            drop_delay,
            dry_run,
        }
    }

    pub async fn reclaim(&self, pattern: &Pattern) -> Result<StepOutcome> {
        let mut tally = StepTally::new(pattern, Step::Database);

        let databases = match self
            .catalog
            .list_owned_databases(&self.owner, &self.excluded)
            .await
        {
            Ok(databases) => databases,
            Err(e) => {
                tally.fail(e)?;
                return Ok(tally.finish());
            }
        };

        let matching: Vec<String> = databases
            .into_iter()
            .filter(|name| pattern.matches_database(name))
            .collect();

        if matching.is_empty() {
            return Ok(tally.finish());
        }

        if self.dry_run {
            for name in &matching {
                tracing::info!(
                    pattern = %pattern,
                    database = %name,
                    "[DRY-RUN] Would drop database"
                );
                tally.reclaimed();
            }
            return Ok(tally.finish());
        }

        // let just-closed connections release their handle on the database
        tokio::time::sleep(self.drop_delay).await;

        for name in &matching {
            tracing::debug!(pattern = %pattern, database = %name, "Dropping database");
            match self.registry.drop_database(name).await {
                Ok(()) => {
                    tracing::info!(pattern = %pattern, database = %name, "Dropped database");
                    tally.reclaimed();
                }
                Err(e) => tally.fail(e)?,
            }
        }

        Ok(tally.finish())
    }
}
