//! Configuration loading and schema definitions for devicegrid.
//!
//! This module provides types and functions for loading devicegrid
//! configuration from TOML files or strings. The schema covers the
//! orchestrator, the automation server, device handling, the suite to run
//! and the test-data source.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads devicegrid configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The configuration is internally inconsistent (see [`Config::validate`])
///
/// # Example
///
/// ```no_run
/// use devicegrid::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("devicegrid.toml"))?;
/// println!("Retry count: {}", config.orchestrator.retry_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads devicegrid configuration from a TOML string.
///
/// # Example
///
/// ```
/// use devicegrid::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [orchestrator]
///     platforms = ["android"]
///     retry_count = 2
///
///     [suite]
///     name = "smoke"
///     command = "./gradlew connectedCheck"
/// "#)?;
///
/// assert_eq!(config.orchestrator.retry_count, 2);
/// assert_eq!(config.server.port, 4723);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.validate()?;

    Ok(config)
}
