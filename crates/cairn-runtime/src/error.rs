//! Runtime error types.

use std::sync::Arc;

use cairn_core::{PluginError, SharedError};
use cairn_transport::TransportError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Resolution, setup or lifecycle failure of the plugin engine.
    #[error(transparent)]
    Plugin(SharedError),

    /// Frame or RPC transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A container could not be launched.
    #[error("Failed to launch container '{container}': {reason}")]
    Launch { container: String, reason: String },

    /// The runtime was used before `start` or after `stop`.
    #[error("Runtime is not running")]
    NotRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Creates a launch error.
    pub fn launch(container: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Launch {
            container: container.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the engine error, if this is one.
    pub fn as_plugin_error(&self) -> Option<&PluginError> {
        match self {
            Self::Plugin(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SharedError> for RuntimeError {
    fn from(err: SharedError) -> Self {
        Self::Plugin(err)
    }
}

impl From<PluginError> for RuntimeError {
    fn from(err: PluginError) -> Self {
        Self::Plugin(Arc::new(err))
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
