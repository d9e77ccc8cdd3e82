//! # Cairn
//!
//! A plugin dependency-resolution and lifecycle orchestration engine.
//!
//! ## Overview
//!
//! Plugins declare the services they **provide** and **consume**. Cairn
//! computes a start order, runs every plugin's setup exactly once with
//! exactly the services it consumes, registers what it provides, and tears
//! everything down in start order. The same plugin set can be split across
//! containers (processes); consumed services from another container arrive
//! as remote stubs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌───────────────────┐   ┌────────────────────────┐
//! │ cairn.toml       │──▶│ PluginCatalog     │──▶│ resolve (start order)  │
//! │ plugins/containers│   │ name → descriptor │   └───────────┬────────────┘
//! └──────────────────┘   └───────────────────┘               ▼
//!                                               ┌────────────────────────┐
//!                                               │ PluginManager (driver) │──▶ Hub events
//!                                               └───────────┬────────────┘
//!                                                           ▼
//!                                 containers ◀── Broadcast / RPC ──▶ containers
//! ```
//!
//! - [`core`]: descriptors, services, setup adapters, resolver, errors
//! - [`framework`]: the orchestrator and the [`App`](prelude::App) handle
//! - [`transport`]: wire frames, broadcast fan-out, remote stubs
//! - [`runtime`]: configuration, logging, containers, [`CairnRuntime`](prelude::CairnRuntime)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cairn::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let catalog = PluginCatalog::new()
//!         .with(PluginDescriptor::new("greeter").provides(["greeting"]).with_setup(
//!             sync_setup(|_ctx| Ok(Provided::new().service("greeting", Service::new("hi"))))
//!         ));
//!
//!     CairnRuntime::new(catalog).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: `cairn.toml` configuration files (default)
//! - `yaml-config`: `cairn.yaml` configuration files
//! - `json-log`: JSON log output

pub use cairn_core as core;
pub use cairn_framework as framework;
pub use cairn_runtime as runtime;
pub use cairn_transport as transport;

/// Commonly used types for writing plugins and hosting them.
///
/// ```rust,ignore
/// use cairn::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use cairn_runtime::{CairnConfig, CairnRuntime, RuntimeError, worker};

    // Hosting without configuration files
    pub use cairn_framework::{App, EngineOptions, PluginCatalog, create_app, create_app_async};

    // Writing plugins
    pub use cairn_core::{
        AppEvent, BoxError, Hub, Imports, PluginDescriptor, PluginError, Provided, Register,
        Service, ServiceInterface, SetupContext, callback_setup, setup_fn, sync_setup,
    };

    pub use async_trait::async_trait;
}
