//! Cairn Runtime - configuration, logging and container orchestration.
//!
//! This crate provides:
//! - Layered configuration (`cairn.toml`, `CAIRN_*` variables) in [`config`]
//! - Logging setup in [`logging`]
//! - Containers, launchers and the cluster coordinator
//! - The top-level [`CairnRuntime`]
//!
//! ```ignore
//! use cairn_runtime::CairnRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CairnRuntime::new(build_catalog());
//!
//!     // Starts the configured plugins (or containers) and waits for Ctrl+C.
//!     // In a container child process this serves that container instead.
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Distributed mode
//!
//! ```toml
//! [[containers]]
//! name = "api"
//! plugins = ["gateway"]
//!
//! [[containers]]
//! name = "math"
//! plugins = ["calculator"]
//! ```
//!
//! The first container (or `master`) runs in the launching process. The
//! others are child processes of the same binary, linked by JSON frames over
//! stdin/stdout; their services are called over TCP.

pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod runtime;
pub mod worker;

pub use cluster::{Cluster, ClusterPlan, ClusterState};
pub use config::{CairnConfig, ConfigError, ConfigLoader, ConfigResult, ContainerConfig};
pub use container::{Container, RemoteDirectory};
pub use error::{RuntimeError, RuntimeResult};
pub use launcher::{CONTAINER_ENV, ContainerLauncher, InProcessLauncher, Launched, ProcessLauncher};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{CairnRuntime, RuntimeBuilder};

pub use tracing;
pub use tracing_subscriber;

/// Logging macros.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
