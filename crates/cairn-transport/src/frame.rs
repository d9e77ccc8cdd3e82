//! Wire types exchanged between the cluster and its containers.
//!
//! Every type here is JSON; one value travels per line.
//!
//! ```text
//! cluster ──Configure──► container
//! cluster ◄──Attached─── container
//! cluster ──Start──────► container      (after every container attached)
//! cluster ◄─Broadcast─►  container      (fan-out to all containers)
//! cluster ◄──Failed───── container
//! cluster ──Shutdown───► container
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cairn_core::PluginEntry;

/// A service registered in one container, announced to all others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAnnouncement {
    /// Service name.
    pub service: String,
    /// Owning container.
    pub container: String,
    /// RPC address of the owning container, when it listens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Operations the service exposes.
    #[serde(default)]
    pub operations: Vec<String>,
}

/// Cluster-wide notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BroadcastMessage {
    /// A container process exists and received its configuration.
    ContainerStarting {
        /// Container name.
        container: String,
    },
    /// A service became available.
    ServiceReady(ServiceAnnouncement),
    /// A plugin finished its setup.
    PluginStarted {
        /// Container name.
        container: String,
        /// Package path of the plugin.
        plugin: String,
    },
    /// Every plugin of a container is registered.
    ContainerReady {
        /// Container name.
        container: String,
    },
    /// A container exited or lost its link.
    ContainerDied {
        /// Container name.
        container: String,
        /// Exit or disconnect description.
        reason: String,
    },
    /// Every container reported ready.
    ContainersDone,
}

impl BroadcastMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContainerStarting { .. } => "containerStarting",
            Self::ServiceReady(_) => "serviceReady",
            Self::PluginStarted { .. } => "pluginStarted",
            Self::ContainerReady { .. } => "containerReady",
            Self::ContainerDied { .. } => "containerDied",
            Self::ContainersDone => "containersDone",
        }
    }
}

/// Configuration sent to a container before it starts anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDescriptor {
    /// Container name.
    pub name: String,
    /// Plugins owned by this container, in configuration order.
    pub plugins: Vec<PluginEntry>,
    /// Whether the container must serve RPC for other containers.
    #[serde(default)]
    pub listen: bool,
    /// Services this container consumes that other containers provide.
    #[serde(default)]
    pub remote_services: Vec<String>,
    /// Per-plugin setup bound in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_timeout_ms: Option<u64>,
}

impl ContainerDescriptor {
    /// Creates a descriptor with no plugins.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugins: Vec::new(),
            listen: false,
            remote_services: Vec::new(),
            setup_timeout_ms: None,
        }
    }
}

/// Control and broadcast envelope on a cluster-container link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// The container's configuration. Sent exactly once, first.
    Configure(ContainerDescriptor),
    /// The container is configured and can route broadcasts.
    Attached {
        /// Container name.
        container: String,
    },
    /// Begin local plugin loading.
    Start,
    /// A cluster-wide notification.
    Broadcast(BroadcastMessage),
    /// The container's boot failed.
    Failed {
        /// Container name.
        container: String,
        /// The boot error.
        reason: String,
    },
    /// Destroy local plugins and exit.
    Shutdown,
}

/// A remote service call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Target service.
    pub service: String,
    /// Target operation.
    pub operation: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// The outcome of an [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id of the request.
    pub id: u64,
    /// The returned value or the remote error message.
    pub result: Result<Value, String>,
}
