//! # Cairn Core
//!
//! The data model and dependency resolver of the Cairn plugin engine.
//!
//! A plugin is described by a [`PluginDescriptor`]: the named services it
//! *provides*, the ones it *consumes*, and a [`Setup`] capability that starts
//! it. This crate provides:
//!
//! - **Resolver**: [`resolve`] validates descriptors and computes a start order
//!   in which every plugin comes after the providers of what it consumes,
//!   reporting missing services and cycles separately.
//! - **Services**: [`Service`] handles, the [`Provided`] set a setup returns,
//!   and the [`Imports`] injected into it.
//! - **Hub**: the [`Hub`] notification bus, pre-registered as the `hub`
//!   service.
//! - **Errors**: the [`PluginError`] taxonomy shared by every layer.
//!
//! The orchestrator that drives setups lives in `cairn-framework`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cairn_core::{PluginDescriptor, Provided, Service, resolve, sync_setup};
//!
//! let config = vec![
//!     PluginDescriptor::new("app")
//!         .consumes(["db"])
//!         .with_setup(sync_setup(|_| Ok(Provided::new()))),
//!     PluginDescriptor::new("db")
//!         .provides(["db"])
//!         .with_setup(sync_setup(|_| Ok(Provided::new().service("db", Service::new(()))))),
//! ];
//!
//! let order = resolve(&config, None)?;
//! assert_eq!(order[0].name(), "db");
//! ```

pub mod descriptor;
pub mod error;
pub mod hub;
pub mod resolver;
pub mod service;
pub mod setup;

pub use descriptor::{PluginDescriptor, PluginEntry, PluginSpec};
pub use error::{
    BoxError, DescriptorField, PluginError, PluginResult, ResolutionFailure, SharedError,
};
pub use hub::{AppEvent, HUB_SERVICE, Hub};
pub use resolver::{Lookup, check_config, resolve};
pub use service::{Destructor, Imports, Provided, Service, ServiceInterface};
pub use setup::{
    CallbackSetup, Register, Setup, SetupContext, SetupFn, SharedSetup, SyncSetup, callback_setup,
    setup_fn, sync_setup,
};

/// Prelude for plugin authors.
pub mod prelude {
    pub use super::{
        AppEvent, BoxError, Imports, PluginDescriptor, Provided, Register, Service,
        ServiceInterface, Setup, SetupContext, callback_setup, setup_fn, sync_setup,
    };
}
