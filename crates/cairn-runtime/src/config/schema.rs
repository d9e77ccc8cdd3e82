//! Configuration schema definitions.
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [engine]
//! setup_timeout_ms = 5000
//!
//! # Single process
//! plugins = ["auth", { packagePath = "calculator", precision = 2 }]
//!
//! # Or distributed
//! master = "api"
//!
//! [[containers]]
//! name = "api"
//! plugins = ["auth"]
//!
//! [[containers]]
//! name = "math"
//! plugins = ["calculator"]
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cairn_core::PluginEntry;
use cairn_framework::EngineOptions;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CairnConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine bounds.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Plugins of a single-process application.
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,

    /// Containers of a distributed application.
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,

    /// Container hosted by the launching process. Defaults to the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
}

impl CairnConfig {
    /// Returns `true` when the application is split into containers.
    pub fn is_distributed(&self) -> bool {
        !self.containers.is_empty()
    }

    /// Name of the in-process container.
    pub fn master_name(&self) -> Option<&str> {
        self.master
            .as_deref()
            .or_else(|| self.containers.first().map(|c| c.name.as_str()))
    }
}

/// One container of a distributed application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Unique container name.
    pub name: String,
    /// Plugins owned by the container.
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

// =============================================================================
// Engine
// =============================================================================

/// Timeouts applied by the engine. Unset means unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on one plugin's setup, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_timeout_ms: Option<u64>,

    /// Upper bound on the whole cluster becoming ready, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// The setup bound as a duration.
    pub fn setup_timeout(&self) -> Option<Duration> {
        self.setup_timeout_ms.map(Duration::from_millis)
    }

    /// The readiness bound as a duration.
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    /// Converts to orchestrator options.
    pub fn to_engine_options(&self) -> EngineOptions {
        EngineOptions {
            setup_timeout: self.setup_timeout(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level name as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to a `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level. `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file for [`LogOutput::File`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include file names and line numbers.
    #[serde(default)]
    pub file_location: bool,

    /// Per-target levels, e.g. `cairn_transport = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}
