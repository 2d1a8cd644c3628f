//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The result is not validated yet so that command-line and environment
    /// overrides can be applied first; call [`Config::validate`] afterwards.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Parse configuration from a YAML string without validating it.
    pub fn parse_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Self::parse_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash identifying this migration for resume validation.
    ///
    /// Only the endpoints and the table selection take part, so tuning
    /// knobs (workers, timeouts) may change between a run and its resume.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.url.as_bytes());
        hasher.update([0]);
        hasher.update(self.target.url.as_bytes());
        hasher.update([0]);
        hasher.update(self.migration.schema.as_bytes());
        for pattern in &self.migration.exclude_tables {
            hasher.update([0]);
            hasher.update(pattern.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  url: postgresql://reader:pw@source.internal/app?sslmode=require
target:
  url: postgresql://writer:pw@localhost:5432/app_copy?sslmode=disable
migration:
  workers: 8
  wave_timeout_secs: 60
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.migration.get_workers(), 8);
        assert_eq!(config.migration.get_wave_timeout().as_secs(), 60);
        assert_eq!(config.migration.get_launch_delay().as_millis(), 100);
        assert_eq!(config.migration.schema, "public");
        assert_eq!(config.tools.dump.program, "pg_dump");
        assert_eq!(config.tools.restore.program, "psql");
    }

    #[test]
    fn test_tool_prefix_args_from_yaml() {
        let yaml = format!(
            "{}tools:\n  dump:\n    program: docker\n    prefix_args: [exec, pg, pg_dump]\n",
            YAML
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.tools.dump.program, "docker");
        assert_eq!(config.tools.dump.prefix_args, vec!["exec", "pg", "pg_dump"]);
        assert_eq!(config.tools.restore.program, "psql");
    }

    #[test]
    fn test_parse_yaml_defers_validation() {
        let config = Config::parse_yaml("migration:\n  workers: 2\n").unwrap();
        assert!(config.source.url.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hash_ignores_tuning() {
        let a = Config::from_yaml(YAML).unwrap();
        let mut b = a.clone();
        b.migration.workers = Some(1);
        b.migration.wave_timeout_secs = Some(5);
        assert_eq!(a.hash(), b.hash());

        b.target.url = "postgresql://writer:pw@elsewhere/app_copy".to_string();
        assert_ne!(a.hash(), b.hash());
    }
}
