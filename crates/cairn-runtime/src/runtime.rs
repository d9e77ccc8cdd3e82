//! Top-level runtime: configuration in, running application out.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cairn_runtime::CairnRuntime;
//!
//! // Loads cairn.toml from the current directory
//! let runtime = CairnRuntime::new(catalog);
//! runtime.run().await?;
//!
//! // Custom configuration
//! let runtime = CairnRuntime::builder()
//!     .catalog(catalog)
//!     .config_file("deploy/cairn.toml")
//!     .profile("production")
//!     .build()?;
//! ```
//!
//! With `plugins` configured, everything runs in this process. With
//! `containers`, the master container runs here and every other container in
//! a child process of the same binary (or in-process, see
//! [`RuntimeBuilder::in_process_workers`]).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use cairn_core::Service;
use cairn_framework::{App, PluginCatalog};

use crate::cluster::{Cluster, ClusterPlan};
use crate::config::{CairnConfig, ConfigLoader, ConfigResult, LogOutput, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::launcher::{ContainerLauncher, InProcessLauncher, ProcessLauncher};
use crate::logging::LoggingBuilder;
use crate::worker;

/// What a started runtime is running.
enum Deployment {
    Single(App),
    Cluster(Cluster),
}

/// The Cairn runtime.
pub struct CairnRuntime {
    config: CairnConfig,
    catalog: PluginCatalog,
    in_process_workers: bool,
    deployment: Mutex<Option<Arc<Deployment>>>,
    running: Arc<RwLock<bool>>,
}

impl CairnRuntime {
    /// Creates a runtime from the configuration found in the default
    /// locations, falling back to defaults if it cannot be loaded.
    pub fn new(catalog: PluginCatalog) -> Self {
        let config = ConfigLoader::new().load_validated().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config ({e}), using defaults");
            CairnConfig::default()
        });
        Self::from_config(&config, catalog)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from `config` and initializes logging.
    ///
    /// In a container child process logging always goes to stderr.
    pub fn from_config(config: &CairnConfig, catalog: PluginCatalog) -> Self {
        let mut logging = LoggingBuilder::from_config(&config.logging);
        if worker::requested_container().is_some() {
            logging = logging.output(LogOutput::Stderr);
        }
        let _ = logging.try_init();

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            mode = if config.is_distributed() { "cluster" } else { "single" },
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            catalog,
            in_process_workers: false,
            deployment: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &CairnConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// The application of this process: the single application, or the
    /// master container's.
    pub fn app(&self) -> Option<App> {
        let deployment = self.deployment.lock().clone()?;
        match deployment.as_ref() {
            Deployment::Single(app) => Some(app.clone()),
            Deployment::Cluster(cluster) => cluster.master_app().cloned(),
        }
    }

    /// Looks up a service registered in this process.
    pub fn get_service(&self, name: &str) -> RuntimeResult<Service> {
        let app = self.app().ok_or(RuntimeError::NotRunning)?;
        Ok(app.get_service(name)?)
    }

    /// Starts every configured plugin and returns once all are ready.
    ///
    /// On failure everything already started is torn down.
    pub async fn start(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Runtime is already running");
                return Ok(());
            }
            *running = true;
        }

        let deployment = match self.deploy().await {
            Ok(deployment) => deployment,
            Err(e) => {
                error!(error = %e, "Runtime failed to start");
                *self.running.write().await = false;
                return Err(e);
            }
        };
        *self.deployment.lock() = Some(Arc::new(deployment));

        info!("Cairn runtime started");
        Ok(())
    }

    async fn deploy(&self) -> RuntimeResult<Deployment> {
        validate_config(&self.config)?;

        if !self.config.is_distributed() {
            let descriptors = self.catalog.resolve_config(&self.config.plugins)?;
            info!(plugins = descriptors.len(), "Starting single-process application");
            let app = App::new(self.config.engine.to_engine_options());
            app.start(descriptors).await?;
            return Ok(Deployment::Single(app));
        }

        let plan = ClusterPlan::new(&self.config, &self.catalog)?;
        let master = InProcessLauncher::new(self.catalog.clone());
        let workers: Box<dyn ContainerLauncher> = if self.in_process_workers {
            Box::new(master.clone())
        } else {
            Box::new(ProcessLauncher::new())
        };

        let cluster = Cluster::launch(plan, &master, workers.as_ref()).await?;
        if let Err(e) = cluster.wait_ready().await {
            cluster.shutdown().await;
            return Err(e.into());
        }
        Ok(Deployment::Cluster(cluster))
    }

    /// Destroys every plugin and stops every container.
    pub async fn stop(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                warn!("Runtime is not running");
                return Ok(());
            }
            *running = false;
        }

        info!("Stopping Cairn runtime");
        let deployment = self.deployment.lock().take();
        match deployment.as_deref() {
            Some(Deployment::Single(app)) => app.destroy().await,
            Some(Deployment::Cluster(cluster)) => cluster.shutdown().await,
            None => {}
        }

        info!("Runtime stopped");
        Ok(())
    }

    /// Runs until a shutdown signal is received.
    ///
    /// In a process launched as a container this serves that container
    /// instead.
    pub async fn run(&self) -> RuntimeResult<()> {
        if let Some(result) = worker::run_if_requested(&self.catalog).await {
            return result;
        }

        self.start().await?;
        info!("Cairn runtime is now running. Press Ctrl+C to stop.");
        wait_for_shutdown().await;
        self.stop().await
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

impl std::fmt::Debug for CairnRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CairnRuntime")
            .field("distributed", &self.config.is_distributed())
            .field("catalog", &self.catalog)
            .finish()
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`CairnRuntime`] with custom configuration.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    catalog: PluginCatalog,
    in_process_workers: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            catalog: PluginCatalog::new(),
            in_process_workers: false,
        }
    }

    /// Sets the plugins this binary can start.
    pub fn catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration programmatically.
    pub fn merge(mut self, config: CairnConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Runs non-master containers as tasks of this process instead of child
    /// processes.
    pub fn in_process_workers(mut self, enabled: bool) -> Self {
        self.in_process_workers = enabled;
        self
    }

    /// Loads and validates the configuration and builds the runtime.
    pub fn build(self) -> ConfigResult<CairnRuntime> {
        let config = self.config_loader.load_validated()?;
        let mut runtime = CairnRuntime::from_config(&config, self.catalog);
        runtime.in_process_workers = self.in_process_workers;
        Ok(runtime)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{PluginDescriptor, PluginEntry, Provided, sync_setup};

    fn catalog() -> PluginCatalog {
        PluginCatalog::new()
            .with(
                PluginDescriptor::new("greeting")
                    .provides(["greeting"])
                    .with_setup(sync_setup(|ctx| {
                        #[derive(serde::Deserialize, Default)]
                        #[serde(default)]
                        struct Options {
                            text: Option<String>,
                        }
                        let options: Options = ctx.options_as()?;
                        let text = options.text.unwrap_or_else(|| "hello".into());
                        Ok(Provided::new().service("greeting", Service::new(text)))
                    })),
            )
            .with(
                PluginDescriptor::new("shout")
                    .consumes(["greeting"])
                    .provides(["shout"])
                    .with_setup(sync_setup(|ctx| {
                        let greeting = ctx
                            .imports()
                            .get_as::<String>("greeting")
                            .ok_or("greeting has the wrong type")?;
                        Ok(Provided::new().service("shout", Service::new(greeting.to_uppercase())))
                    })),
            )
    }

    fn single(plugins: Vec<PluginEntry>) -> CairnConfig {
        CairnConfig {
            plugins,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_process_lifecycle() {
        let config = single(vec![
            "shout".into(),
            serde_json::from_value(serde_json::json!({ "packagePath": "greeting", "text": "hi" }))
                .unwrap(),
        ]);
        let runtime = CairnRuntime::from_config(&config, catalog());

        assert!(matches!(
            runtime.get_service("shout"),
            Err(RuntimeError::NotRunning)
        ));

        runtime.start().await.unwrap();
        assert!(runtime.is_running().await);
        let shout = runtime.get_service("shout").unwrap();
        assert_eq!(*shout.downcast::<String>().unwrap(), "HI");

        runtime.stop().await.unwrap();
        assert!(!runtime.is_running().await);
        assert!(runtime.app().is_none());
    }

    #[tokio::test]
    async fn test_start_failure_resets_running() {
        let runtime = CairnRuntime::from_config(&single(vec!["shout".into()]), catalog());
        let err = runtime.start().await.unwrap_err();
        assert!(err.to_string().contains("Missing services: greeting"));
        assert!(!runtime.is_running().await);
    }

    #[tokio::test]
    async fn test_run_until() {
        let runtime = CairnRuntime::from_config(&single(vec!["greeting".into()]), catalog());
        runtime.run_until(async {}).await.unwrap();
        assert!(!runtime.is_running().await);
    }
}
