//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};
use crate::target::tls::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.connection_string.trim().is_empty() {
        return Err(MigrateError::Config(
            "source.connection_string is required".into(),
        ));
    }
    if config.source.schema.trim().is_empty() {
        return Err(MigrateError::Config("source.schema cannot be empty".into()));
    }
    if config.target.connection_string.trim().is_empty() {
        return Err(MigrateError::Config(
            "target.connection_string is required".into(),
        ));
    }
    if let Some(ref mode) = config.target.ssl_mode {
        mode.parse::<SslMode>()?;
    }

    let migration = &config.migration;
    if migration.max_connections == 0 {
        return Err(MigrateError::Config(
            "migration.max_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_source_connections {
        return Err(MigrateError::Config(
            "migration.max_source_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_target_connections {
        return Err(MigrateError::Config(
            "migration.max_target_connections must be at least 1".into(),
        ));
    }
    for (name, secs) in [
        ("read_timeout_secs", migration.read_timeout_secs),
        ("write_timeout_secs", migration.write_timeout_secs),
        ("statement_timeout_secs", migration.statement_timeout_secs),
    ] {
        if secs == 0 {
            return Err(MigrateError::Config(format!(
                "migration.{} must be at least 1",
                name
            )));
        }
    }
    if migration.ignore_tables.iter().any(|t| t.trim().is_empty()) {
        return Err(MigrateError::Config(
            "migration.ignore_tables cannot contain empty names".into(),
        ));
    }

    let state = &config.state;
    if state.checkpoint_file.as_os_str().is_empty() {
        return Err(MigrateError::Config("state.checkpoint_file is required".into()));
    }
    if state.restore_script_file.as_os_str().is_empty() {
        return Err(MigrateError::Config(
            "state.restore_script_file is required".into(),
        ));
    }
    if state.checkpoint_file == state.restore_script_file {
        return Err(MigrateError::Config(
            "state.checkpoint_file and state.restore_script_file must differ".into(),
        ));
    }

    Ok(())
}
