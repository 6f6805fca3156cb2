use crate::config::types::{
    Config, EngineConfig, IdentityConfig, OutputConfig, ResourceConfig, RetryConfig, TargetConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_run_name(&config.run.scraper)?;
    validate_engine_config(&config.engine)?;
    validate_retry_config(&config.retry)?;
    validate_identity_config(&config.identities)?;
    validate_resource_config(&config.resources)?;
    validate_output_config(&config.output)?;
    validate_target_config(&config.target, &config.engine)?;
    Ok(())
}

/// Scraper names end up in run ids and file names
fn validate_run_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Validation("scraper cannot be empty".to_string()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::Validation(format!(
            "scraper must contain only alphanumeric characters, '-' and '_', got '{}'",
            name
        )));
    }

    Ok(())
}

fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.worker_count < 1 || config.worker_count > 64 {
        return Err(ConfigError::Validation(format!(
            "worker_count must be between 1 and 64, got {}",
            config.worker_count
        )));
    }

    if config.max_loop_count < 1 {
        return Err(ConfigError::Validation(
            "max_loop_count must be >= 1".to_string(),
        ));
    }

    if config.max_attempts_per_method < 1 {
        return Err(ConfigError::Validation(
            "max_attempts_per_method must be >= 1".to_string(),
        ));
    }

    if config.methods.is_empty() {
        return Err(ConfigError::Validation(
            "at least one method must be configured".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for method in &config.methods {
        if method.trim().is_empty() {
            return Err(ConfigError::Validation(
                "method names cannot be empty".to_string(),
            ));
        }
        if !seen.insert(method.as_str()) {
            return Err(ConfigError::Validation(format!(
                "method '{}' is listed more than once",
                method
            )));
        }
    }

    if config.checkpoint_batch_size < 1 {
        return Err(ConfigError::Validation(
            "checkpoint_batch_size must be >= 1".to_string(),
        ));
    }

    if config.call_timeout_seconds < 1 {
        return Err(ConfigError::Validation(
            "call_timeout_seconds must be >= 1".to_string(),
        ));
    }

    for (name, value) in [
        ("request_pause_base", config.request_pause_base),
        ("jitter_min", config.jitter_min),
        ("jitter_max", config.jitter_max),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigError::Validation(format!(
                "{} must be a non-negative number of seconds, got {}",
                name, value
            )));
        }
    }

    if config.jitter_min > config.jitter_max {
        return Err(ConfigError::Validation(format!(
            "jitter_min ({}) cannot exceed jitter_max ({})",
            config.jitter_min, config.jitter_max
        )));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.backoff_base_ms > config.backoff_max_ms {
        return Err(ConfigError::Validation(format!(
            "backoff_base_ms ({}) cannot exceed backoff_max_ms ({})",
            config.backoff_base_ms, config.backoff_max_ms
        )));
    }
    Ok(())
}

fn validate_identity_config(config: &IdentityConfig) -> Result<(), ConfigError> {
    if config.rotation_limit < 1 {
        return Err(ConfigError::Validation(
            "rotation_limit must be >= 1".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for identity in &config.entries {
        if identity.id.is_empty() {
            return Err(ConfigError::Validation(
                "identity id cannot be empty".to_string(),
            ));
        }
        if !seen.insert(identity.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "identity '{}' is listed more than once",
                identity.id
            )));
        }
        if let Some(proxy) = &identity.proxy {
            Url::parse(proxy).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid proxy for '{}': {}", identity.id, e))
            })?;
        }
    }

    Ok(())
}

fn validate_resource_config(config: &ResourceConfig) -> Result<(), ConfigError> {
    if let (Some(soft), Some(hard)) = (config.memory_soft_limit_mb, config.memory_limit_mb) {
        if soft > hard {
            return Err(ConfigError::Validation(format!(
                "memory_soft_limit_mb ({}) cannot exceed memory_limit_mb ({})",
                soft, hard
            )));
        }
    }
    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.records_path.is_empty() {
        return Err(ConfigError::Validation(
            "records_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates URL templates for the built-in HTTP target
///
/// Templates are optional (library users bring their own extractor), but when
/// any are given every configured method needs one.
fn validate_target_config(target: &TargetConfig, engine: &EngineConfig) -> Result<(), ConfigError> {
    if target.url_templates.is_empty() {
        return Ok(());
    }

    for method in &engine.methods {
        let template = target.url_templates.get(method).ok_or_else(|| {
            ConfigError::Validation(format!("no url template for method '{}'", method))
        })?;

        if !template.contains("{key}") {
            return Err(ConfigError::Validation(format!(
                "url template for '{}' must contain {{key}}",
                method
            )));
        }

        Url::parse(&template.replace("{key}", "probe")).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid url template for '{}': {}", method, e))
        })?;
    }

    if let Some(selector) = &target.expect_selector {
        scraper::Selector::parse(selector).map_err(|e| {
            ConfigError::Validation(format!("invalid expect_selector '{}': {:?}", selector, e))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_run_name() {
        assert!(validate_run_name("argentina").is_ok());
        assert!(validate_run_name("north_macedonia-2").is_ok());

        assert!(validate_run_name("").is_err());
        assert!(validate_run_name("a b").is_err());
        assert!(validate_run_name("../etc").is_err());
    }

    #[test]
    fn test_duplicate_methods_rejected() {
        let mut config = Config::default();
        config.engine.methods = vec!["browser".to_string(), "browser".to_string()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_jitter_bounds() {
        let mut config = Config::default();
        config.engine.jitter_min = 3.0;
        config.engine.jitter_max = 1.0;
        assert!(validate(&config).is_err());

        config.engine.jitter_min = -1.0;
        config.engine.jitter_max = 1.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_soft_limit_above_hard_limit() {
        let mut config = Config::default();
        config.resources.memory_limit_mb = Some(512);
        config.resources.memory_soft_limit_mb = Some(1024);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let mut config = Config::default();
        let mut identity = Identity::direct();
        identity.id = "p1".to_string();
        identity.proxy = Some("not a url".to_string());
        config.identities.entries.push(identity);
        assert!(matches!(
            validate(&config).unwrap_err(),
            ConfigError::InvalidUrl(_)
        ));
    }

    #[test]
    fn test_url_templates_cover_every_method() {
        let mut config = Config::default();
        config.engine.methods = vec!["browser".to_string(), "api".to_string()];
        config.target.url_templates.insert(
            "browser".to_string(),
            "https://example.com/?q={key}".to_string(),
        );
        assert!(validate(&config).is_err());

        config.target.url_templates.insert(
            "api".to_string(),
            "https://example.com/api/{key}".to_string(),
        );
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_url_template_needs_placeholder() {
        let mut config = Config::default();
        config
            .target
            .url_templates
            .insert("browser".to_string(), "https://example.com/".to_string());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let mut config = Config::default();
        config.target.url_templates.insert(
            "browser".to_string(),
            "https://example.com/?q={key}".to_string(),
        );
        config.target.expect_selector = Some("div[[".to_string());
        assert!(validate(&config).is_err());
    }
}
