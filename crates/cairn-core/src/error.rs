//! Unified error types for the Cairn engine.
//!
//! Every failure the engine can report to a host is a [`PluginError`]. Errors
//! are shared on the notification bus as [`SharedError`] since one failure may
//! be observed by several subscribers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by plugin-authored code (setups, destructors, service
/// operations).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A [`PluginError`] shared between the host and every bus subscriber.
pub type SharedError = Arc<PluginError>;

// =============================================================================
// Descriptor validation
// =============================================================================

/// The descriptor field a validation failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorField {
    /// The setup capability.
    Setup,
    /// The `provides` list.
    Provides,
    /// The `consumes` list.
    Consumes,
}

impl fmt::Display for DescriptorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Setup => "setup function",
            Self::Provides => "provides array",
            Self::Consumes => "consumes array",
        })
    }
}

// =============================================================================
// Resolution diagnostics
// =============================================================================

/// Diagnostic context attached to a failed resolution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    /// Consumed services no stuck plugin provides, in first-seen order.
    ///
    /// Empty when the failure is a genuine cycle.
    pub unresolved: Vec<String>,
    /// Services resolved before the pass stalled, in resolution order.
    pub resolved: Vec<String>,
    /// Package paths of the plugins that could not be placed.
    pub stuck: Vec<String>,
}

impl ResolutionFailure {
    /// Returns `true` when every stuck consume is provided by another stuck
    /// plugin.
    pub fn is_cycle(&self) -> bool {
        self.unresolved.is_empty()
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Could not resolve dependencies\n")?;
        if self.is_cycle() {
            f.write_str("Config contains cyclic dependencies")
        } else {
            write!(f, "Missing services: {}", self.unresolved.join(", "))
        }
    }
}

// =============================================================================
// Plugin errors
// =============================================================================

/// Errors reported by the resolver, the orchestrator and the container layer.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A descriptor lacks a required field.
    #[error("Plugin is missing the {field} {plugin}")]
    InvalidDescriptor {
        /// Package path of the offending descriptor.
        plugin: String,
        /// The missing field.
        field: DescriptorField,
    },

    /// A configuration entry names a plugin the catalog does not know.
    #[error("Unknown plugin '{name}'")]
    UnknownPlugin {
        /// The requested package path.
        name: String,
    },

    /// The dependency graph has missing services or a cycle.
    #[error("{0}")]
    Unresolvable(ResolutionFailure),

    /// A plugin's setup returned an error.
    #[error("Plugin '{plugin}' failed to start: {source}")]
    SetupFailed {
        /// Package path of the failing plugin.
        plugin: String,
        /// The error produced by the setup.
        #[source]
        source: BoxError,
    },

    /// A plugin did not return a service it declared in `provides`.
    #[error("Plugin failed to provide {service} service. {plugin}")]
    ProvideMismatch {
        /// Package path of the plugin.
        plugin: String,
        /// The declared but missing service.
        service: String,
    },

    /// Two plugins provide the same service name.
    #[error("Plugin '{plugin}' attempted to override an already provided service: {service}")]
    DuplicateService {
        /// Package path of the second provider.
        plugin: String,
        /// The contested service name.
        service: String,
    },

    /// A call to a service in another container could not be completed.
    #[error("Remote call {service}.{operation} failed: {reason}")]
    RemoteDispatch {
        /// Target service.
        service: String,
        /// Target operation.
        operation: String,
        /// Transport or remote failure description.
        reason: String,
    },

    /// A plugin's setup did not complete within the configured bound.
    #[error("Plugin '{plugin}' did not finish setup within {timeout:?}")]
    SetupTimeout {
        /// Package path of the plugin.
        plugin: String,
        /// The configured bound.
        timeout: Duration,
    },

    /// Containers did not all report ready within the configured bound.
    #[error("Containers not ready within {timeout:?}: {}", .pending.join(", "))]
    ReadinessTimeout {
        /// The configured bound.
        timeout: Duration,
        /// Names of the containers that never reported ready.
        pending: Vec<String>,
    },

    /// A container exited or lost its link before reporting ready.
    #[error("Container '{container}' died: {reason}")]
    ContainerDied {
        /// The container name.
        container: String,
        /// Exit or disconnect description.
        reason: String,
    },

    /// A container reported a boot failure of its own plugins.
    #[error("Container '{container}' failed: {reason}")]
    ContainerFailed {
        /// The container name.
        container: String,
        /// The error reported by the container.
        reason: String,
    },

    /// A host lookup named a service that is not registered.
    #[error("Service '{name}' not found")]
    ServiceNotFound {
        /// The requested service name.
        name: String,
    },

    /// The application was destroyed before the operation could complete.
    #[error("Application has been destroyed")]
    Destroyed,
}

impl PluginError {
    /// Creates a setup failure for `plugin`.
    pub fn setup_failed(plugin: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::SetupFailed {
            plugin: plugin.into(),
            source: source.into(),
        }
    }

    /// Creates a remote dispatch failure.
    pub fn remote(
        service: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::RemoteDispatch {
            service: service.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Creates a service-not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::ServiceNotFound { name: name.into() }
    }

    /// Returns the resolution diagnostics when this is a resolver failure.
    pub fn resolution(&self) -> Option<&ResolutionFailure> {
        match self {
            Self::Unresolvable(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns `true` for errors raised before any plugin ran.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::InvalidDescriptor { .. } | Self::UnknownPlugin { .. } | Self::Unresolvable(_)
        )
    }
}

/// Result type for engine operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_services_message() {
        let err = PluginError::Unresolvable(ResolutionFailure {
            unresolved: vec!["a".into(), "b".into()],
            resolved: vec!["hub".into()],
            stuck: vec!["x".into()],
        });
        assert_eq!(
            err.to_string(),
            "Could not resolve dependencies\nMissing services: a, b"
        );
        assert!(err.is_preflight());
    }

    #[test]
    fn test_cycle_message() {
        let failure = ResolutionFailure {
            unresolved: vec![],
            resolved: vec!["hub".into()],
            stuck: vec!["a".into(), "b".into()],
        };
        assert!(failure.is_cycle());
        assert!(failure.to_string().contains("Config contains cyclic dependencies"));
    }

    #[test]
    fn test_provide_mismatch_message() {
        let err = PluginError::ProvideMismatch {
            plugin: "bar".into(),
            service: "bar.plugin".into(),
        };
        assert!(err.to_string().starts_with("Plugin failed to provide bar.plugin"));
    }

    #[test]
    fn test_readiness_timeout_lists_pending() {
        let err = PluginError::ReadinessTimeout {
            timeout: Duration::from_secs(5),
            pending: vec!["worker-a".into(), "worker-b".into()],
        };
        assert!(err.to_string().ends_with("worker-a, worker-b"));
    }
}
