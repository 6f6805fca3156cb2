use crate::config::env::apply_process_env;
use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// Environment overrides (`MAX_LOOP_COUNT`, `WORKER_COUNT`, ...) are applied
/// after parsing and before validation.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use harvest_engine::config::load_config;
///
/// let config = load_config(Path::new("harvest.toml")).unwrap();
/// println!("Workers: {}", config.engine.worker_count);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let mut config = parse_config(&std::fs::read_to_string(path)?)?;
    apply_process_env(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Parses TOML content without touching the environment or validating
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Stored on each run so a resume under a changed configuration can be flagged.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
