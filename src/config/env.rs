//! Environment variable overrides
//!
//! Scrapers are often launched by an orchestrator that only speaks environment
//! variables, so every operational knob can be overridden after the TOML file is
//! parsed. Overrides are applied before validation.

use crate::config::types::Config;
use crate::ConfigError;
use std::str::FromStr;

/// Environment variable naming the run to resume
pub const RUN_ID_VAR: &str = "HARVEST_RUN_ID";

/// Applies overrides from the process environment
pub fn apply_process_env(config: &mut Config) -> Result<(), ConfigError> {
    apply_env_overrides(config, |name| std::env::var(name).ok())
}

/// Applies overrides using `lookup` to resolve variable names
///
/// Unset or empty variables leave the config untouched; unparsable values are
/// rejected rather than silently ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("MAX_LOOP_COUNT") {
        config.engine.max_loop_count = parse("MAX_LOOP_COUNT", &v)?;
    }
    if let Some(v) = get("MAX_ATTEMPTS_PER_METHOD") {
        config.engine.max_attempts_per_method = parse("MAX_ATTEMPTS_PER_METHOD", &v)?;
    }
    if let Some(v) = get("WORKER_COUNT") {
        config.engine.worker_count = parse("WORKER_COUNT", &v)?;
    }
    if let Some(v) = get("REQUEST_PAUSE_BASE") {
        config.engine.request_pause_base = parse("REQUEST_PAUSE_BASE", &v)?;
    }
    if let Some(v) = get("JITTER_MIN") {
        config.engine.jitter_min = parse("JITTER_MIN", &v)?;
    }
    if let Some(v) = get("JITTER_MAX") {
        config.engine.jitter_max = parse("JITTER_MAX", &v)?;
    }
    if let Some(v) = get("IDENTITY_ROTATION_LIMIT") {
        config.identities.rotation_limit = parse("IDENTITY_ROTATION_LIMIT", &v)?;
    }
    if let Some(v) = get("MEMORY_LIMIT_MB") {
        config.resources.memory_limit_mb = Some(parse("MEMORY_LIMIT_MB", &v)?);
    }
    if let Some(v) = get("MEMORY_SOFT_LIMIT_MB") {
        config.resources.memory_soft_limit_mb = Some(parse("MEMORY_SOFT_LIMIT_MB", &v)?);
    }
    if let Some(v) = get("MAX_BROWSER_RUNTIME_SECONDS") {
        config.session.max_browser_runtime_seconds = parse("MAX_BROWSER_RUNTIME_SECONDS", &v)?;
    }

    Ok(())
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
    })
}
