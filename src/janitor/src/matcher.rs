//! Pattern matching of live resources against a build destination name.
//!
//! A single build owns several resources that all derive from its destination
//! name: the workspace directory under `build/`, every database whose name
//! starts with it (the build database plus worker/replica copies), and the
//! server process started with `-d <destination>`.

use std::fmt;
use std::path::{Path, PathBuf};

/// Destination name used as the matching key across resource domains.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Database names match by prefix.
    pub fn matches_database(&self, database: &str) -> bool {
        database.starts_with(&self.0)
    }

    /// Command lines match when the space-joined arguments contain `-d <pattern>`.
    ///
    /// The match is not anchored on the end of the token, so `pr-12` also
    /// matches a process started with `-d pr-120`.
    pub fn matches_command_line<S: AsRef<str>>(&self, args: &[S]) -> bool {
        let joined = args
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        joined.contains(&self.database_flag())
    }

    /// Workspace directory of the build: `<root>/build/<pattern>`.
    pub fn build_path(&self, root: &Path) -> PathBuf {
        root.join("build").join(&self.0)
    }

    fn database_flag(&self) -> String {
        format!("-d {}", self.0)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pattern {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Pattern {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_prefix_match() {
        let pattern = Pattern::new("pr-12");
        assert!(pattern.matches_database("pr-12"));
        assert!(pattern.matches_database("pr-12-all"));
        assert!(pattern.matches_database("pr-12-base_worker"));
        assert!(!pattern.matches_database("x-pr-12"));
        assert!(!pattern.matches_database("pr-1"));
    }

    #[test]
    fn test_command_line_match() {
        let pattern = Pattern::new("pr-12");
        assert!(pattern.matches_command_line(&["odoo", "-d", "pr-12", "--workers=2"]));
        assert!(pattern.matches_command_line(&["python", "openerp-server", "-d", "pr-12-all"]));
        assert!(!pattern.matches_command_line(&["odoo", "--database", "pr-12"]));
        assert!(!pattern.matches_command_line(&["odoo", "-d", "pr-13"]));
        assert!(!pattern.matches_command_line::<&str>(&[]));
    }

    #[test]
    fn test_command_line_overmatches_longer_destination() {
        // pr-12 is a prefix of pr-120; this is accepted behaviour
        let pattern = Pattern::new("pr-12");
        assert!(pattern.matches_command_line(&["odoo", "-d", "pr-120"]));
    }

    #[test]
    fn test_flag_must_be_followed_by_single_space() {
        let pattern = Pattern::new("pr-12");
        assert!(!pattern.matches_command_line(&["odoo", "-dpr-12"]));
        // an argument that itself contains the flag still matches once joined
        assert!(pattern.matches_command_line(&["sh", "-c", "odoo -d pr-12"]));
    }

    #[test]
    fn test_build_path_is_exact() {
        let pattern = Pattern::new("pr-12");
        assert_eq!(
            pattern.build_path(Path::new("/srv/runbot")),
            PathBuf::from("/srv/runbot/build/pr-12")
        );
    }
}
