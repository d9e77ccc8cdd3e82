//! Layered configuration for Cairn applications.
//!
//! A config describes either one process (`plugins`) or a cluster of
//! named containers (`containers`), plus logging and engine bounds.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    CairnConfig, ContainerConfig, EngineConfig, LogFormat, LogLevel, LogOutput, LoggingConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
