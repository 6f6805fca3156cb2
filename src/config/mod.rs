//! Configuration module for the harvest engine
//!
//! This module handles loading, parsing, and validating TOML configuration files,
//! with environment variable overrides for the operational knobs.
//!
//! # Example
//!
//! ```no_run
//! use harvest_engine::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Max loop count: {}", config.engine.max_loop_count);
//! ```

mod env;
mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ClassifierConfig, Config, EngineConfig, IdentityConfig, OutputConfig, ResourceConfig,
    RetryConfig, RunConfig, SessionConfig, TargetConfig,
};

// Re-export parser functions
pub use env::{apply_env_overrides, apply_process_env, RUN_ID_VAR};
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
