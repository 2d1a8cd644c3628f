//! Configuration validation.

use super::{Config, EndpointConfig};
use crate::error::{MigrateError, Result};
use crate::source::tls::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("target", &config.target)?;

    // Cannot migrate onto the source
    if config.source.url.trim() == config.target.url.trim() {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    if config.migration.schema.trim().is_empty() {
        return Err(MigrateError::Config("migration.schema is required".into()));
    }
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.wave_timeout_secs {
        return Err(MigrateError::Config(
            "migration.wave_timeout_secs must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.max_catalog_connections {
        return Err(MigrateError::Config(
            "migration.max_catalog_connections must be at least 1".into(),
        ));
    }

    if config.tools.dump.program.trim().is_empty() {
        return Err(MigrateError::Config("tools.dump.program is required".into()));
    }
    if config.tools.restore.program.trim().is_empty() {
        return Err(MigrateError::Config(
            "tools.restore.program is required".into(),
        ));
    }

    Ok(())
}

fn validate_endpoint(name: &str, endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.url.trim().is_empty() {
        return Err(MigrateError::Config(format!(
            "{name}.url is required (config file, --{name}-url or PGWAVE_{}_URL)",
            name.to_uppercase()
        )));
    }
    endpoint
        .url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| MigrateError::Config(format!("{name}.url is not a valid connection string: {e}")))?;
    if let Some(mode) = &endpoint.ssl_mode {
        SslMode::parse(mode)?;
    }
    Ok(())
}
