//! Configuration loading

use anyhow::Result;
use std::path::Path;

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit` path (from the command line)
/// 2. `RTSPCAST_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. Fall back to environment variables only
///
/// The result is not validated; callers apply command line overrides first.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            anyhow::bail!("Config file not found: {path}");
        }
        return Config::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config from {path}: {e}"));
    }

    let config_path = std::env::var("RTSPCAST_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load config from {path}: {e}"))?
    } else {
        Config::from_env()?
    };

    Ok(config)
}

/// Fail fast on misconfiguration, reporting every problem at once
///
/// Runs before logging is initialized, so problems go to stderr.
pub fn validate_config(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        );
    }
    Ok(())
}
