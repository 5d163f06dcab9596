use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "janitor.toml";

/// Environment variable prefix, nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "JANITOR__";

/// Build registry connection and layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// PostgreSQL DSN of the build registry database
    pub dsn: String,
    /// Build root; build workspaces live under `<root>/build`
    pub root: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("postgres://localhost/runbot"),
            root: PathBuf::from(".data/runbot"),
        }
    }
}

/// Access to the database server catalog used to find build databases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN used to read `pg_database`, normally the `postgres` maintenance database
    pub admin_dsn: String,
    /// Template database of the active configuration, never reclaimed
    pub template: String,
    /// Pause before dropping databases so recently closed connections release them
    #[serde(with = "humantime_serde")]
    pub drop_delay: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            admin_dsn: String::from("postgres://localhost/postgres"),
            template: String::from("template1"),
            drop_delay: Duration::from_secs(1),
        }
    }
}

/// Scheduling and safety knobs of the janitor itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Interval between two cleanup passes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Builds untouched for longer than this are forced to `done` at startup
    #[serde(with = "humantime_serde")]
    pub staleness_window: Duration,
    /// Log reclamations without performing them
    #[serde(default)]
    pub dry_run: bool,
    /// OS account owning build databases, defaults to the effective user
    #[serde(default)]
    pub owner: Option<String>,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            staleness_window: Duration::from_secs(24 * 3600),
            dry_run: false,
            owner: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Build registry configuration
    pub registry: RegistryConfig,
    /// Database server catalog configuration
    pub database: DatabaseConfig,
    /// Janitor scheduling configuration
    pub janitor: JanitorConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file_exact(path))
            .extract()
            .map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Directory holding one workspace per build.
    pub fn build_dir(&self) -> PathBuf {
        self.registry.root.join("build")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.registry.dsn.is_empty() {
            anyhow::bail!("Registry DSN cannot be empty");
        }

        if self.registry.root.as_os_str().is_empty() {
            anyhow::bail!("Registry root cannot be empty");
        }

        if self.database.admin_dsn.is_empty() {
            anyhow::bail!("Database admin DSN cannot be empty");
        }

        if self.janitor.interval.is_zero() {
            anyhow::bail!("Janitor interval must be positive");
        }

        if self.janitor.staleness_window.is_zero() {
            anyhow::bail!("Janitor staleness window must be positive");
        }

        if self.janitor.owner.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("Janitor owner cannot be empty when set");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert_eq!(config.registry.dsn, "postgres://localhost/runbot");
        assert_eq!(config.build_dir(), PathBuf::from(".data/runbot/build"));
        assert_eq!(config.database.template, "template1");
        assert_eq!(config.database.drop_delay, Duration::from_secs(1));
        assert_eq!(config.janitor.interval, Duration::from_secs(60));
        assert_eq!(config.janitor.staleness_window, Duration::from_secs(86400));
        assert!(!config.janitor.dry_run);
        assert!(config.janitor.owner.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configless_operation() {
        Jail::expect_with(|_jail| {
            let config = Configuration::load().expect("defaults should load");
            assert_eq!(config.registry.root, PathBuf::from(".data/runbot"));
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_with_humantime_durations() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [registry]
                dsn = "postgres://runbot@db/runbot"
                root = "/srv/runbot"

                [database]
                template = "template_odoo"
                drop_delay = "250ms"

                [janitor]
                interval = "5m"
                staleness_window = "12h"
                dry_run = true
                "#,
            )?;

            let config = Configuration::load().expect("file should load");
            assert_eq!(config.registry.dsn, "postgres://runbot@db/runbot");
            assert_eq!(config.build_dir(), PathBuf::from("/srv/runbot/build"));
            assert_eq!(config.database.template, "template_odoo");
            assert_eq!(config.database.drop_delay, Duration::from_millis(250));
            // untouched keys keep their defaults
            assert_eq!(config.database.admin_dsn, "postgres://localhost/postgres");
            assert_eq!(config.janitor.interval, Duration::from_secs(300));
            assert_eq!(config.janitor.staleness_window, Duration::from_secs(12 * 3600));
            assert!(config.janitor.dry_run);
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.set_env("JANITOR__REGISTRY__DSN", "postgres://env/runbot");
            jail.set_env("JANITOR__JANITOR__OWNER", "runbot");
            jail.set_env("JANITOR__JANITOR__INTERVAL", "30s");

            let config = Configuration::load().expect("env should load");
            assert_eq!(config.registry.dsn, "postgres://env/runbot");
            assert_eq!(config.janitor.owner.as_deref(), Some("runbot"));
            assert_eq!(config.janitor.interval, Duration::from_secs(30));
            Ok(())
        });
    }

    #[test]
    fn test_load_from_missing_path_fails() {
        Jail::expect_with(|_jail| {
            let result = Configuration::load_from_path(Path::new("does-not-exist.toml"));
            assert!(result.is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Configuration::default();
        config.janitor.interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_dsn_and_owner() {
        let mut config = Configuration::default();
        config.registry.dsn.clear();
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.janitor.owner = Some(String::new());
        assert!(config.validate().is_err());
    }
}
