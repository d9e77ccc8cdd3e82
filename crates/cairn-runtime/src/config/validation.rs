//! Configuration validation utilities.

use std::collections::{HashMap, HashSet};

use super::error::{ConfigError, ConfigResult};
use super::schema::{CairnConfig, ContainerConfig, EngineConfig, LogOutput, LoggingConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &CairnConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_engine_config(&config.engine)?;
    validate_containers(config)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    if logging.filters.keys().any(|target| target.trim().is_empty()) {
        return Err(ConfigError::validation("Log filter targets cannot be empty"));
    }
    Ok(())
}

fn validate_engine_config(engine: &EngineConfig) -> ConfigResult<()> {
    if engine.setup_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "engine.setup_timeout_ms must be greater than 0",
        ));
    }
    if engine.ready_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "engine.ready_timeout_ms must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_containers(config: &CairnConfig) -> ConfigResult<()> {
    if !config.is_distributed() {
        if let Some(master) = &config.master {
            return Err(ConfigError::UnknownMaster(master.clone()));
        }
        return Ok(());
    }

    if !config.plugins.is_empty() {
        return Err(ConfigError::validation(
            "Top-level plugins and containers cannot be combined; assign every plugin to a container",
        ));
    }

    let mut names = HashSet::new();
    for container in &config.containers {
        validate_container_name(container)?;
        if !names.insert(container.name.as_str()) {
            return Err(ConfigError::DuplicateContainer(container.name.clone()));
        }
    }

    let mut owners: HashMap<&str, &str> = HashMap::new();
    for container in &config.containers {
        for entry in &container.plugins {
            if let Some(first) = owners.insert(entry.package_path(), &container.name) {
                return Err(ConfigError::PluginAssignedTwice {
                    plugin: entry.package_path().to_string(),
                    first: first.to_string(),
                    second: container.name.clone(),
                });
            }
        }
    }

    if let Some(master) = &config.master
        && !names.contains(master.as_str())
    {
        return Err(ConfigError::UnknownMaster(master.clone()));
    }

    Ok(())
}

fn validate_container_name(container: &ContainerConfig) -> ConfigResult<()> {
    if container.name.is_empty() {
        return Err(ConfigError::missing_field("containers.name"));
    }
    if container.name.chars().any(char::is_whitespace) {
        return Err(ConfigError::validation(format!(
            "Container name cannot contain whitespace: '{}'",
            container.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::PluginEntry;

    fn container(name: &str, plugins: &[&str]) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            plugins: plugins.iter().map(|p| PluginEntry::from(*p)).collect(),
        }
    }

    fn distributed(containers: Vec<ContainerConfig>) -> CairnConfig {
        CairnConfig {
            containers,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_empty_config() {
        assert!(validate_config(&CairnConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = CairnConfig::default();
        config.engine.setup_timeout_ms = Some(0);
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_duplicate_container_name() {
        let config = distributed(vec![container("api", &["a"]), container("api", &["b"])]);
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::DuplicateContainer(name)) if name == "api"
        ));
    }

    #[test]
    fn test_plugin_assigned_twice() {
        let config = distributed(vec![
            container("api", &["auth"]),
            container("math", &["calc", "auth"]),
        ]);
        let err = validate_config(&config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Plugin 'auth' is assigned to both 'api' and 'math'"
        );
    }

    #[test]
    fn test_unknown_master() {
        let mut config = distributed(vec![container("api", &["auth"])]);
        config.master = Some("ghost".into());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::UnknownMaster(_))
        ));
    }

    #[test]
    fn test_plugins_and_containers_exclusive() {
        let mut config = distributed(vec![container("api", &["auth"])]);
        config.plugins = vec!["calc".into()];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_file_output_requires_path() {
        let mut config = CairnConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
    }
}
