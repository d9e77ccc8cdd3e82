//! The setup capability every plugin implements.
//!
//! There is exactly one capability, [`Setup`], an async operation from a
//! [`SetupContext`] to the plugin's [`Provided`] services. Three adapters cover
//! the usual ways plugin code is written:
//!
//! - [`setup_fn`]: an async closure.
//! - [`sync_setup`]: a plain closure returning immediately.
//! - [`callback_setup`]: a closure handed a [`Register`] handle that it
//!   completes later, possibly from another task.
//!
//! ```rust,ignore
//! let db = PluginDescriptor::new("db")
//!     .provides(["db"])
//!     .setup(sync_setup(|_ctx| Ok(Provided::new().service("db", Service::new(Pool::new())))));
//!
//! let api = PluginDescriptor::new("api")
//!     .consumes(["db"])
//!     .setup(setup_fn(|ctx| async move {
//!         let pool = ctx.imports().get_as::<Pool>("db").ok_or("db missing")?;
//!         Ok(Provided::new().on_destroy(move || async move { pool.close().await }))
//!     }));
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::BoxError;
use crate::service::{Imports, Provided};

// =============================================================================
// SetupContext
// =============================================================================

/// Everything a plugin receives when it is started.
#[derive(Debug, Clone)]
pub struct SetupContext {
    plugin: String,
    options: Value,
    imports: Imports,
}

impl SetupContext {
    /// Creates a context for `plugin`.
    pub fn new(plugin: impl Into<String>, options: Value, imports: Imports) -> Self {
        Self {
            plugin: plugin.into(),
            options,
            imports,
        }
    }

    /// The plugin's package path.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Free-form options from the plugin's configuration entry.
    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Deserializes the options into `T`.
    ///
    /// A plugin configured without options deserializes from an empty object,
    /// so `T` should default its fields.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.options {
            Value::Null => serde_json::from_value(Value::Object(Map::new())),
            other => serde_json::from_value(other.clone()),
        }
    }

    /// The injected services.
    pub fn imports(&self) -> &Imports {
        &self.imports
    }

    /// Consumes the context, returning the injected services.
    pub fn into_imports(self) -> Imports {
        self.imports
    }
}

// =============================================================================
// Setup
// =============================================================================

/// Starts a plugin and returns the services it provides.
#[async_trait]
pub trait Setup: Send + Sync {
    /// Runs the plugin's initialization.
    async fn setup(&self, ctx: SetupContext) -> Result<Provided, BoxError>;
}

/// A setup shared between descriptors and the catalog.
pub type SharedSetup = Arc<dyn Setup>;

#[async_trait]
impl<S: Setup + ?Sized> Setup for Arc<S> {
    async fn setup(&self, ctx: SetupContext) -> Result<Provided, BoxError> {
        (**self).setup(ctx).await
    }
}

// ─── Async closures ─────────────────────────────────────────────────────────

/// Adapter for async closures. See [`setup_fn`].
pub struct SetupFn<F>(F);

#[async_trait]
impl<F, Fut> Setup for SetupFn<F>
where
    F: Fn(SetupContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Provided, BoxError>> + Send + 'static,
{
    async fn setup(&self, ctx: SetupContext) -> Result<Provided, BoxError> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as a setup.
pub fn setup_fn<F, Fut>(f: F) -> SharedSetup
where
    F: Fn(SetupContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Provided, BoxError>> + Send + 'static,
{
    Arc::new(SetupFn(f))
}

// ─── Synchronous closures ───────────────────────────────────────────────────

/// Adapter for synchronous closures. See [`sync_setup`].
pub struct SyncSetup<F>(F);

#[async_trait]
impl<F> Setup for SyncSetup<F>
where
    F: Fn(SetupContext) -> Result<Provided, BoxError> + Send + Sync + 'static,
{
    async fn setup(&self, ctx: SetupContext) -> Result<Provided, BoxError> {
        (self.0)(ctx)
    }
}

/// Wraps a synchronous closure as a setup.
pub fn sync_setup<F>(f: F) -> SharedSetup
where
    F: Fn(SetupContext) -> Result<Provided, BoxError> + Send + Sync + 'static,
{
    Arc::new(SyncSetup(f))
}

// ─── Completion callbacks ───────────────────────────────────────────────────

/// One-shot completion handle passed to a [`callback_setup`] closure.
///
/// Dropping the handle without completing it fails the plugin's setup.
pub struct Register {
    tx: oneshot::Sender<Result<Provided, BoxError>>,
}

impl Register {
    /// Completes the setup with `result`.
    pub fn complete(self, result: Result<Provided, BoxError>) {
        // The receiver is gone only if the boot was abandoned.
        let _ = self.tx.send(result);
    }

    /// Completes the setup successfully.
    pub fn ok(self, provided: Provided) {
        self.complete(Ok(provided));
    }

    /// Fails the setup.
    pub fn err(self, error: impl Into<BoxError>) {
        self.complete(Err(error.into()));
    }
}

/// Adapter for completion-callback closures. See [`callback_setup`].
pub struct CallbackSetup<F>(F);

#[async_trait]
impl<F> Setup for CallbackSetup<F>
where
    F: Fn(SetupContext, Register) + Send + Sync + 'static,
{
    async fn setup(&self, ctx: SetupContext) -> Result<Provided, BoxError> {
        let (tx, rx) = oneshot::channel();
        (self.0)(ctx, Register { tx });
        rx.await
            .unwrap_or_else(|_| Err("setup dropped its register handle without completing".into()))
    }
}

/// Wraps a closure that reports completion through a [`Register`] handle.
pub fn callback_setup<F>(f: F) -> SharedSetup
where
    F: Fn(SetupContext, Register) + Send + Sync + 'static,
{
    Arc::new(CallbackSetup(f))
}
