//! # Cairn Framework
//!
//! Plugin lifecycle orchestration on top of `cairn-core`.
//!
//! This layer provides:
//! - [`PluginManager`]: sequential plugin start, service registration,
//!   readiness events, hot-loading and teardown
//! - [`App`] with [`create_app`] / [`create_app_async`] for hosts
//! - [`PluginCatalog`] mapping configuration entries to descriptors
//! - [`ServiceRegistry`], the per-process name to service map
//!
//! Multi-process deployment lives in `cairn-runtime`; it plugs into the
//! manager through [`ServiceDirectory`].

pub mod app;
pub mod catalog;
pub mod manager;
pub mod registry;

pub use app::{App, create_app, create_app_async, create_app_with};
pub use catalog::PluginCatalog;
pub use manager::{
    BatchHandle, EngineOptions, PluginManager, PluginState, ServiceDirectory, SystemState,
};
pub use registry::{ENGINE_OWNER, ServiceRegistry};
