//! Configuration validation.

use super::{Config, DriverKind, EndpointConfig};
use crate::error::{MigrateError, Result};
use crate::schedule::ScheduleRequest;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("target", &config.target)?;

    if matches!(config.source.driver, DriverKind::Mssql) {
        return Err(MigrateError::Config(
            "source.driver must be 'postgres', 'mysql' or 'memory'".into(),
        ));
    }
    if !matches!(config.target.driver, DriverKind::Mssql | DriverKind::Memory) {
        return Err(MigrateError::Config(format!(
            "target.driver must be 'mssql' or 'memory', got '{}'",
            config.target.driver
        )));
    }

    // Cannot migrate to the same database
    if config.source.driver != DriverKind::Memory
        && config.source.connection_string.is_none()
        && config.source.host == config.target.host
        && config.source.port() == config.target.port()
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    if config.migration.workers == 0 {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for table in &config.migration.tables {
        if table.name.trim().is_empty() {
            return Err(MigrateError::Config(
                "migration.tables entries need a name".into(),
            ));
        }
        if !seen.insert(table.name.to_lowercase()) {
            return Err(MigrateError::Config(format!(
                "table '{}' is listed more than once",
                table.name
            )));
        }
    }

    if config.migration.watermark_column.trim().is_empty() {
        return Err(MigrateError::Config(
            "migration.watermark_column cannot be empty".into(),
        ));
    }

    for rule in &config.translation.extra_rules {
        if let Err(e) = regex::Regex::new(&rule.pattern) {
            return Err(MigrateError::Config(format!(
                "translation rule '{}' has an invalid pattern: {}",
                rule.name, e
            )));
        }
    }

    if let Some(schedule) = &config.schedule {
        ScheduleRequest::new(&schedule.cron, &schedule.command)?;
    }

    Ok(())
}

fn validate_endpoint(side: &str, endpoint: &EndpointConfig) -> Result<()> {
    // A raw connection string is opaque to us
    if endpoint.connection_string.is_some() || endpoint.driver == DriverKind::Memory {
        return Ok(());
    }
    if endpoint.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", side)));
    }
    if endpoint.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.database is required",
            side
        )));
    }
    if endpoint.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", side)));
    }
    Ok(())
}
