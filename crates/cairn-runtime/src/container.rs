//! One member of a cluster.
//!
//! A container owns a [`PluginManager`] for its share of the plugins. Its
//! [`RemoteDirectory`] is fed by `ServiceReady` broadcasts, so plugins that
//! consume services of other containers are parked until those appear.
//!
//! ```text
//!            Configure            Start
//! cluster ───────────► configure ──────► app.start ──► local hub events
//!                          │                                 │
//!                          ▼                                 ▼
//!                     RpcServer (listen)      ServiceReady / PluginStarted /
//!                                             ContainerReady / Failed
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cairn_core::{AppEvent, HUB_SERVICE, PluginDescriptor, Service};
use cairn_framework::{App, EngineOptions, PluginCatalog, PluginManager, ServiceDirectory};
use cairn_transport::{
    BroadcastMessage, ContainerDescriptor, Frame, Link, RemoteConnector, RemoteStub, RpcServer,
    ServiceAnnouncement, TransportError,
};

use crate::error::RuntimeResult;

// =============================================================================
// RemoteDirectory
// =============================================================================

/// Services other containers provide, as announced so far.
pub struct RemoteDirectory {
    container: String,
    remote: HashSet<String>,
    announced: RwLock<HashMap<String, Service>>,
    /// Expected services announced without an address, with the reason.
    unreachable: RwLock<HashMap<String, String>>,
    connector: Arc<RemoteConnector>,
}

impl RemoteDirectory {
    /// Creates a directory expecting `remote` services from other containers.
    pub fn new<I, S>(container: impl Into<String>, remote: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            container: container.into(),
            remote: remote.into_iter().map(Into::into).collect(),
            announced: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashMap::new()),
            connector: Arc::new(RemoteConnector::new()),
        }
    }

    /// Records an announcement. Returns `true` if it settled a service
    /// plugins here may be parked on, either as a callable stub or as
    /// unreachable.
    ///
    /// Own announcements and repeats are ignored, as are announcements without
    /// an address for services this container does not expect.
    pub fn record(&self, announcement: &ServiceAnnouncement) -> bool {
        if announcement.container == self.container {
            return false;
        }
        if self.announced.read().contains_key(&announcement.service) {
            return false;
        }
        let Some(stub) = RemoteStub::new(announcement, Arc::clone(&self.connector)) else {
            if !self.remote.contains(&announcement.service) {
                return false;
            }
            warn!(
                service = %announcement.service,
                owner = %announcement.container,
                "Remote service announced without an address"
            );
            let reason = format!(
                "service has no interface in container '{}'",
                announcement.container
            );
            return self
                .unreachable
                .write()
                .insert(announcement.service.clone(), reason)
                .is_none();
        };

        debug!(
            service = %announcement.service,
            owner = %announcement.container,
            "Remote service available"
        );
        self.unreachable.write().remove(&announcement.service);
        self.announced
            .write()
            .insert(announcement.service.clone(), stub.into_service());
        true
    }

    /// Names of the remote services announced so far.
    pub fn announced(&self) -> Vec<String> {
        let mut names: Vec<_> = self.announced.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ServiceDirectory for RemoteDirectory {
    fn is_remote(&self, name: &str) -> bool {
        self.remote.contains(name)
    }

    fn remote_service(&self, name: &str) -> Option<Service> {
        self.announced.read().get(name).cloned()
    }

    fn unreachable(&self, name: &str) -> Option<String> {
        self.unreachable.read().get(name).cloned()
    }
}

// =============================================================================
// Container
// =============================================================================

/// A configured container, ready to [`run`](Container::run).
pub struct Container {
    name: String,
    plugins: Vec<PluginDescriptor>,
    app: App,
    directory: Arc<RemoteDirectory>,
    server: Option<RpcServer>,
}

impl Container {
    /// Resolves the descriptor's plugins against `catalog`, creates the
    /// engine and, if the container listens, binds its RPC server.
    pub async fn configure(
        descriptor: ContainerDescriptor,
        catalog: &PluginCatalog,
    ) -> RuntimeResult<Self> {
        let plugins = catalog.resolve_config(&descriptor.plugins)?;

        let mut options = EngineOptions::default();
        if let Some(ms) = descriptor.setup_timeout_ms {
            options = options.setup_timeout(std::time::Duration::from_millis(ms));
        }

        let directory = Arc::new(RemoteDirectory::new(
            descriptor.name.clone(),
            descriptor.remote_services.iter().cloned(),
        ));
        let manager = PluginManager::with_directory(options, directory.clone());

        let server = if descriptor.listen {
            let local = manager.clone();
            let provider = Arc::new(move |name: &str| local.get_service(name).ok());
            Some(RpcServer::bind("127.0.0.1:0", provider).await?)
        } else {
            None
        };

        info!(
            container = %descriptor.name,
            plugins = plugins.len(),
            remote = ?descriptor.remote_services,
            address = ?server.as_ref().map(RpcServer::address),
            "Container configured"
        );

        Ok(Self {
            name: descriptor.name,
            plugins,
            app: App::from_manager(manager),
            directory,
            server,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The container's local application.
    pub fn app(&self) -> &App {
        &self.app
    }

    /// RPC address, when the container listens.
    pub fn address(&self) -> Option<String> {
        self.server.as_ref().map(RpcServer::address)
    }

    pub fn directory(&self) -> &Arc<RemoteDirectory> {
        &self.directory
    }

    /// Serves the cluster link until `Shutdown` or until the link closes,
    /// then destroys the local plugins.
    pub async fn run(self, link: Link) -> RuntimeResult<()> {
        let Link { tx, mut rx } = link;
        let mut events = self.app.subscribe();

        tx.send(Frame::Attached {
            container: self.name.clone(),
        })
        .map_err(|_| TransportError::ConnectionClosed {
            reason: "cluster link closed before attach".into(),
        })?;

        let mut started = false;
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(Frame::Start) if !started => {
                        started = true;
                        self.start();
                    }
                    Some(Frame::Start) => warn!(container = %self.name, "Duplicate start ignored"),
                    Some(Frame::Broadcast(message)) => self.on_broadcast(message),
                    Some(Frame::Shutdown) => {
                        info!(container = %self.name, "Shutdown requested");
                        break;
                    }
                    Some(other) => warn!(container = %self.name, frame = ?other, "Unexpected frame"),
                    None => {
                        warn!(container = %self.name, "Cluster link closed");
                        break;
                    }
                },
                Some(event) = events.recv() => self.forward(event, &tx),
            }
        }

        self.app.destroy().await;
        if let Some(server) = &self.server {
            server.shutdown();
        }
        Ok(())
    }

    fn start(&self) {
        let app = self.app.clone();
        let plugins = self.plugins.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = app.start(plugins).await {
                error!(container = %name, error = %e, "Container failed to start");
            }
        });
    }

    fn on_broadcast(&self, message: BroadcastMessage) {
        match message {
            BroadcastMessage::ServiceReady(announcement) => {
                if self.directory.record(&announcement) {
                    self.app.manager().release_parked();
                }
            }
            other => debug!(container = %self.name, kind = other.kind(), "Broadcast received"),
        }
    }

    /// Turns a local hub event into the frame the cluster expects.
    fn forward(&self, event: AppEvent, tx: &mpsc::UnboundedSender<Frame>) {
        let frame = match event {
            AppEvent::Service { name } if name == HUB_SERVICE => return,
            AppEvent::Service { name } => {
                let Ok(service) = self.app.get_service(&name) else {
                    return;
                };
                let address = service.interface().and(self.address());
                Frame::Broadcast(BroadcastMessage::ServiceReady(ServiceAnnouncement {
                    service: name,
                    container: self.name.clone(),
                    address,
                    operations: service.operations(),
                }))
            }
            AppEvent::Plugin { name } => Frame::Broadcast(BroadcastMessage::PluginStarted {
                container: self.name.clone(),
                plugin: name,
            }),
            AppEvent::Ready => Frame::Broadcast(BroadcastMessage::ContainerReady {
                container: self.name.clone(),
            }),
            AppEvent::ReadyAdditional => return,
            AppEvent::Error(e) => Frame::Failed {
                container: self.name.clone(),
                reason: e.to_string(),
            },
        };
        if tx.send(frame).is_err() {
            debug!(container = %self.name, "Cluster link closed, event dropped");
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("plugins", &self.plugins.len())
            .field("address", &self.address())
            .finish()
    }
}

/// Waits for `Configure` on `link`, then configures and runs the container.
///
/// A configuration failure is reported to the cluster as `Failed` before the
/// error is returned.
pub async fn serve(catalog: &PluginCatalog, mut link: Link) -> RuntimeResult<()> {
    let descriptor = loop {
        match link.rx.recv().await {
            Some(Frame::Configure(descriptor)) => break descriptor,
            Some(Frame::Shutdown) | None => return Ok(()),
            Some(other) => warn!(frame = ?other, "Frame before configuration ignored"),
        }
    };

    let name = descriptor.name.clone();
    match Container::configure(descriptor, catalog).await {
        Ok(container) => container.run(link).await,
        Err(e) => {
            let _ = link.tx.send(Frame::Failed {
                container: name,
                reason: e.to_string(),
            });
            Err(e)
        }
    }
}
