//! Configuration loading and schema definitions for automator.
//!
//! A suite file is a TOML document that declares the engine settings, the
//! commands used to reach the remote execution service, report outputs and
//! the devices with their test cases.
//!
//! # The Configuration File Format is described in [`schema::Config`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// The file is parsed and then checked with [`Config::validate`].
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The configuration fails validation (no devices, duplicate devices, ...)
///
/// # Example
///
/// ```no_run
/// use automator::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("automator.toml"))?;
/// println!("Retest count: {}", config.automator.retest_count);
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

/// Loads configuration from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically.
///
/// # Example
///
/// ```
/// use automator::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [automator]
///     suite_name = "smoke"
///     retest_count = 2
///
///     [client]
///     submit_command = "submit {device} {test_case}"
///     fetch_command = "fetch {execution_id}"
///
///     [[devices]]
///     name = "pixel"
///
///     [[devices.test_cases]]
///     name = "login"
/// "#)?;
///
/// assert_eq!(config.automator.retest_count, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.validate().context("Invalid config")?;

    Ok(config)
}
