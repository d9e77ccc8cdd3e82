//! Entry point of a container child process.
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let catalog = build_catalog();
//!     if let Some(result) = worker::run_if_requested(&catalog).await {
//!         return Ok(result?);
//!     }
//!     CairnRuntime::builder().catalog(catalog).build()?.run().await?;
//!     Ok(())
//! }
//! ```

use tokio::io::{stdin, stdout};
use tracing::info;

use cairn_framework::PluginCatalog;
use cairn_transport::Link;

use crate::config::{ConfigLoader, LogOutput, LoggingConfig};
use crate::container;
use crate::error::RuntimeResult;
use crate::launcher::CONTAINER_ENV;
use crate::logging::LoggingBuilder;

/// Name of the container this process was launched for, if any.
pub fn requested_container() -> Option<String> {
    std::env::var(CONTAINER_ENV).ok().filter(|name| !name.is_empty())
}

/// Serves a container over stdin/stdout when this process was launched as
/// one, and returns `None` otherwise.
///
/// Logging follows the usual configuration but always goes to stderr.
pub async fn run_if_requested(catalog: &PluginCatalog) -> Option<RuntimeResult<()>> {
    let name = requested_container()?;

    let logging = worker_logging(ConfigLoader::new());
    let _ = LoggingBuilder::from_config(&logging)
        .output(LogOutput::Stderr)
        .try_init();

    info!(container = %name, pid = std::process::id(), "Worker process started");
    let link = Link::spawn(&name, stdin(), stdout());
    Some(container::serve(catalog, link).await)
}

/// Logging settings from `loader`, or the defaults when the configuration
/// cannot be loaded. Tracing is not up yet, so the failure goes to stderr.
fn worker_logging(loader: ConfigLoader) -> LoggingConfig {
    match loader.load() {
        Ok(config) => config.logging,
        Err(e) => {
            eprintln!("Warning: Failed to load config ({e}), using defaults");
            LoggingConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use figment::Jail;

    #[tokio::test]
    async fn test_not_requested() {
        if requested_container().is_none() {
            assert!(run_if_requested(&PluginCatalog::new()).await.is_none());
        }
    }

    #[test]
    fn test_worker_logging_falls_back_on_load_error() {
        let logging = worker_logging(ConfigLoader::new().file("/definitely/not/here/cairn.toml"));
        assert_eq!(logging.level, LogLevel::default());
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_worker_logging_reads_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cairn.toml",
                r#"
                [logging]
                level = "warn"
                "#,
            )?;

            let logging = worker_logging(
                ConfigLoader::new()
                    .search_path(jail.directory())
                    .without_env(),
            );
            assert_eq!(logging.level, LogLevel::Warn);
            Ok(())
        });
    }
}
