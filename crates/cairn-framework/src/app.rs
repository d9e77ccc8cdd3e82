//! The host-facing application handle.
//!
//! [`App`] wraps a [`PluginManager`] with the host-level policy: a failed boot
//! destroys whatever already started before the error is reported.
//!
//! ```rust,ignore
//! let app = create_app_async(catalog.resolve_config(&config.plugins)?).await?;
//! let calc = app.get_service("calculator")?;
//! app.destroy().await;
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use cairn_core::{AppEvent, PluginDescriptor, PluginResult, Service, SharedError};

use crate::manager::{BatchHandle, EngineOptions, PluginManager, PluginState, SystemState};

/// A running (or starting) application.
#[derive(Clone, Debug)]
pub struct App {
    manager: PluginManager,
}

impl App {
    /// Creates an application with no plugins started yet.
    pub fn new(options: EngineOptions) -> Self {
        Self::from_manager(PluginManager::new(options))
    }

    /// Wraps an existing manager.
    pub fn from_manager(manager: PluginManager) -> Self {
        Self { manager }
    }

    /// The underlying manager.
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Subscribes to lifecycle events. Subscribe before [`start`](Self::start)
    /// to observe every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AppEvent> {
        self.manager.subscribe()
    }

    /// Starts the initial plugin set. On failure everything already started
    /// is destroyed before the error is returned.
    pub async fn start(&self, descriptors: Vec<PluginDescriptor>) -> Result<(), SharedError> {
        if let Err(e) = self.manager.start(descriptors).await {
            error!(error = %e, "Application failed to start");
            self.manager.destroy().await;
            return Err(e);
        }
        info!(services = self.manager.services().len(), "Application ready");
        Ok(())
    }

    /// Starts the initial plugin set in the background and reports the outcome
    /// through `callback`, exactly once.
    pub fn boot<F>(&self, descriptors: Vec<PluginDescriptor>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<App, SharedError>) + Send + 'static,
    {
        let app = self.clone();
        tokio::spawn(async move {
            let outcome = app.start(descriptors).await.map(|()| app.clone());
            callback(outcome);
        })
    }

    /// Waits until the initial set is up.
    pub async fn wait_ready(&self) -> Result<(), SharedError> {
        self.manager.wait_ready().await
    }

    /// Current system state.
    pub fn state(&self) -> SystemState {
        self.manager.state()
    }

    /// Watches system state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SystemState> {
        self.manager.watch_state()
    }

    /// Returns a registered service.
    pub fn get_service(&self, name: &str) -> PluginResult<Service> {
        self.manager.get_service(name)
    }

    /// Returns a registered service's value as `T`, if it is one.
    pub fn get_service_as<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: std::any::Any + Send + Sync,
    {
        self.manager.get_service(name).ok()?.downcast::<T>()
    }

    /// State of one plugin.
    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.manager.plugin_state(name)
    }

    /// Hot-loads more plugins. See [`PluginManager::load_additional_plugins`].
    pub fn load_additional_plugins(
        &self,
        descriptors: Vec<PluginDescriptor>,
    ) -> Result<BatchHandle, SharedError> {
        self.manager.load_additional_plugins(descriptors)
    }

    /// Runs every plugin destructor. Idempotent.
    pub async fn destroy(&self) {
        self.manager.destroy().await;
    }
}

/// Boots `descriptors` in the background and reports through `callback`
/// exactly once: with the app when the initial set is ready, or with the first
/// error after the partial application was destroyed.
///
/// The returned handle is usable right away, for example to subscribe.
pub fn create_app<F>(descriptors: Vec<PluginDescriptor>, callback: F) -> App
where
    F: FnOnce(Result<App, SharedError>) + Send + 'static,
{
    let app = App::new(EngineOptions::default());
    app.boot(descriptors, callback);
    app
}

/// Boots `descriptors` and returns the app once the initial set is ready.
pub async fn create_app_async(descriptors: Vec<PluginDescriptor>) -> Result<App, SharedError> {
    create_app_with(descriptors, EngineOptions::default()).await
}

/// Like [`create_app_async`], with explicit engine options.
pub async fn create_app_with(
    descriptors: Vec<PluginDescriptor>,
    options: EngineOptions,
) -> Result<App, SharedError> {
    let app = App::new(options);
    app.start(descriptors).await?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cairn_core::{PluginError, Provided, sync_setup};
    use tokio::sync::oneshot;

    fn provider(name: &str, destroyed: &Arc<AtomicUsize>) -> PluginDescriptor {
        let destroyed = Arc::clone(destroyed);
        PluginDescriptor::new(name)
            .provides([name])
            .setup(sync_setup(move |ctx| {
                let destroyed = Arc::clone(&destroyed);
                Ok(Provided::new()
                    .service(ctx.plugin(), Service::new(ctx.plugin().to_string()))
                    .on_destroy(move || async move {
                        destroyed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
            }))
    }

    #[tokio::test]
    async fn test_create_app_reports_ready_app() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        create_app(vec![provider("bar", &destroyed)], move |result| {
            let _ = tx.send(result);
        });

        let app = rx.await.unwrap().unwrap();
        let bar = app.get_service_as::<String>("bar").unwrap();
        assert_eq!(bar.as_str(), "bar");
        assert_eq!(app.state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn test_create_app_destroys_on_failure() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let broken = PluginDescriptor::new("broken")
            .provides(["broken"])
            .setup(sync_setup(|_| Ok(Provided::new())));

        let counter = Arc::clone(&calls);
        create_app(vec![provider("ok", &destroyed), broken], move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(*err, PluginError::ProvideMismatch { .. }));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_app_async_cycle() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let a = provider("a", &destroyed).consumes(["b"]);
        let b = provider("b", &destroyed).consumes(["a"]);

        let err = create_app_async(vec![a, b]).await.unwrap_err();
        assert!(err.to_string().contains("Config contains cyclic dependencies"));
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    }
}
