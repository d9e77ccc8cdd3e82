//! Partitioning an application into containers.
//!
//! [`ClusterPlan`] checks the whole partitioned configuration before any
//! container exists: every plugin must be known, no service may be provided
//! by two containers, and the union of all plugins must resolve (so a missing
//! service or a cycle is reported up front).
//!
//! [`Cluster`] then launches every container and coordinates them:
//!
//! ```text
//!  launch all ──► wait for every Attached ──► Start to all
//!                                                 │
//!          Broadcast frames are fanned out ◄──────┘
//!          ContainerReady × N ──► ContainersDone, ready
//!          Failed / link closed before ready ──► failed
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cairn_core::{HUB_SERVICE, PluginDescriptor, PluginError, SharedError, resolve};
use cairn_framework::{App, PluginCatalog};
use cairn_transport::{BroadcastMessage, Broadcaster, ContainerDescriptor, Frame};

use crate::config::{CairnConfig, ConfigError, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::launcher::{ContainerLauncher, Launched};

/// How long a container gets to exit after `Shutdown` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// ClusterPlan
// =============================================================================

/// A checked partitioning: one descriptor per container.
#[derive(Debug, Clone)]
pub struct ClusterPlan {
    containers: Vec<ContainerDescriptor>,
    master: String,
    ready_timeout: Option<Duration>,
}

impl ClusterPlan {
    /// Validates `config` and runs the pre-flight checks against `catalog`.
    pub fn new(config: &CairnConfig, catalog: &PluginCatalog) -> RuntimeResult<Self> {
        validate_config(config)?;
        let Some(master) = config.master_name() else {
            return Err(ConfigError::validation("A cluster needs at least one container").into());
        };

        let mut resolved: Vec<(&str, Vec<PluginDescriptor>)> =
            Vec::with_capacity(config.containers.len());
        for container in &config.containers {
            let descriptors = catalog.resolve_config(&container.plugins)?;
            resolved.push((container.name.as_str(), descriptors));
        }

        check_cross_container_duplicates(&resolved)?;

        let union: Vec<PluginDescriptor> = resolved
            .iter()
            .flat_map(|(_, descriptors)| descriptors.iter().cloned())
            .collect();
        resolve(&union, None)?;

        let containers = config
            .containers
            .iter()
            .zip(&resolved)
            .map(|(container, (name, descriptors))| {
                let provides: HashSet<&str> = descriptors
                    .iter()
                    .flat_map(|d| d.provided().iter().map(String::as_str))
                    .collect();

                let mut remote_services = Vec::new();
                for service in descriptors.iter().flat_map(|d| d.consumed()) {
                    if service != HUB_SERVICE
                        && !provides.contains(service.as_str())
                        && !remote_services.contains(service)
                    {
                        remote_services.push(service.clone());
                    }
                }

                let listen = resolved
                    .iter()
                    .filter(|(other, _)| other != name)
                    .flat_map(|(_, others)| others.iter().flat_map(|d| d.consumed()))
                    .any(|service| provides.contains(service.as_str()));

                ContainerDescriptor {
                    name: container.name.clone(),
                    plugins: container.plugins.clone(),
                    listen,
                    remote_services,
                    setup_timeout_ms: config.engine.setup_timeout_ms,
                }
            })
            .collect();

        Ok(Self {
            containers,
            master: master.to_string(),
            ready_timeout: config.engine.ready_timeout(),
        })
    }

    /// Container descriptors in configuration order.
    pub fn containers(&self) -> &[ContainerDescriptor] {
        &self.containers
    }

    pub fn get(&self, name: &str) -> Option<&ContainerDescriptor> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Name of the container hosted in the launching process.
    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout
    }

    fn names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }
}

fn check_cross_container_duplicates(
    resolved: &[(&str, Vec<PluginDescriptor>)],
) -> Result<(), PluginError> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for (container, descriptors) in resolved {
        for descriptor in descriptors {
            for service in descriptor.provided() {
                match owners.insert(service, container) {
                    Some(first) if first != *container => {
                        return Err(PluginError::DuplicateService {
                            plugin: descriptor.name().to_string(),
                            service: service.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Cluster
// =============================================================================

/// Overall readiness of a cluster.
#[derive(Debug, Clone)]
pub enum ClusterState {
    Starting,
    /// Every container reported ready.
    Ready,
    Failed(SharedError),
}

enum Inbound {
    Frame(String, Frame),
    Closed(String),
}

struct Member {
    name: String,
    app: Option<App>,
    child: Option<Child>,
    task: Option<JoinHandle<()>>,
}

/// A running set of containers.
pub struct Cluster {
    plan: ClusterPlan,
    broadcaster: Arc<Broadcaster>,
    members: Mutex<Vec<Member>>,
    apps: HashMap<String, App>,
    ready: Arc<Mutex<HashSet<String>>>,
    state: watch::Receiver<ClusterState>,
    stopping: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl Cluster {
    /// Launches every container concurrently: the master through `master`,
    /// all others through `workers`.
    ///
    /// Returns once every launch returned. Readiness is observed with
    /// [`wait_ready`](Self::wait_ready).
    pub async fn launch(
        plan: ClusterPlan,
        master: &dyn ContainerLauncher,
        workers: &dyn ContainerLauncher,
    ) -> RuntimeResult<Self> {
        info!(
            containers = ?plan.names(),
            master = %plan.master,
            "Launching cluster"
        );

        let launches = plan.containers.iter().map(|descriptor| {
            let launcher = if descriptor.name == plan.master {
                master
            } else {
                workers
            };
            async move { (descriptor.name.clone(), launcher.launch(descriptor).await) }
        });
        let results = join_all(launches).await;

        let broadcaster = Arc::new(Broadcaster::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut members = Vec::with_capacity(results.len());
        let mut apps = HashMap::new();
        let mut failure = None;

        for (name, result) in results {
            let launched = match result {
                Ok(launched) => launched,
                Err(e) => {
                    error!(container = %name, error = %e, "Container launch failed");
                    failure.get_or_insert(e);
                    continue;
                }
            };
            let Launched {
                link,
                app,
                child,
                task,
            } = launched;

            broadcaster.attach(name.clone(), link.tx);
            tokio::spawn(forward_inbound(name.clone(), link.rx, inbound_tx.clone()));
            if let Some(app) = &app {
                apps.insert(name.clone(), app.clone());
            }
            members.push(Member {
                name,
                app,
                child,
                task,
            });
        }

        let ready = Arc::new(Mutex::new(HashSet::new()));
        let stopping = Arc::new(AtomicBool::new(failure.is_some()));
        let (state_tx, state_rx) = watch::channel(ClusterState::Starting);

        let pump = tokio::spawn(
            Pump {
                expected: plan.names(),
                attached: HashSet::new(),
                started: false,
                ready: Arc::clone(&ready),
                broadcaster: Arc::clone(&broadcaster),
                state: state_tx,
                stopping: Arc::clone(&stopping),
            }
            .run(inbound_rx),
        );

        let cluster = Self {
            plan,
            broadcaster,
            members: Mutex::new(members),
            apps,
            ready,
            state: state_rx,
            stopping,
            pump,
        };

        if let Some(e) = failure {
            cluster.stop_members().await;
            return Err(e);
        }
        Ok(cluster)
    }

    pub fn plan(&self) -> &ClusterPlan {
        &self.plan
    }

    pub fn state(&self) -> ClusterState {
        self.state.borrow().clone()
    }

    /// Application of an in-process container.
    pub fn app(&self, container: &str) -> Option<&App> {
        self.apps.get(container)
    }

    /// Application of the master container.
    pub fn master_app(&self) -> Option<&App> {
        self.app(&self.plan.master)
    }

    /// Containers that have not reported ready yet, in configuration order.
    pub fn pending(&self) -> Vec<String> {
        let ready = self.ready.lock();
        self.plan
            .names()
            .into_iter()
            .filter(|name| !ready.contains(name))
            .collect()
    }

    /// Waits until every container is ready, one fails or dies, or the
    /// configured readiness bound passes.
    pub async fn wait_ready(&self) -> Result<(), SharedError> {
        let mut state = self.state.clone();
        let wait = async move {
            loop {
                let current = state.borrow_and_update().clone();
                match current {
                    ClusterState::Ready => return Ok(()),
                    ClusterState::Failed(e) => return Err(e),
                    ClusterState::Starting => {}
                }
                if state.changed().await.is_err() {
                    return Err(Arc::new(PluginError::Destroyed));
                }
            }
        };

        match self.plan.ready_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let pending = self.pending();
                    warn!(timeout = ?limit, pending = ?pending, "Cluster readiness timed out");
                    Err(Arc::new(PluginError::ReadinessTimeout {
                        timeout: limit,
                        pending,
                    }))
                }
            },
            None => wait.await,
        }
    }

    /// Sends `Shutdown` to every container and waits for them to exit,
    /// killing child processes that outlive the grace period. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down cluster");
        self.stop_members().await;
    }

    async fn stop_members(&self) {
        self.broadcaster.send_all(Frame::Shutdown);
        let members = std::mem::take(&mut *self.members.lock());

        for mut member in members {
            if let Some(task) = member.task.take()
                && tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err()
            {
                warn!(container = %member.name, "Container task did not stop in time");
            }
            if let Some(app) = member.app.take() {
                app.destroy().await;
            }
            if let Some(mut child) = member.child.take() {
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(container = %member.name, status = %status, "Container exited");
                    }
                    _ => {
                        warn!(container = %member.name, "Killing container process");
                        let _ = child.kill().await;
                    }
                }
            }
        }
        self.pump.abort();
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("master", &self.plan.master)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn forward_inbound(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(frame) = rx.recv().await {
        if inbound.send(Inbound::Frame(name.clone(), frame)).is_err() {
            return;
        }
    }
    let _ = inbound.send(Inbound::Closed(name));
}

// ─── Pump ───────────────────────────────────────────────────────────────────

/// Single consumer of every container's frames.
struct Pump {
    expected: Vec<String>,
    attached: HashSet<String>,
    started: bool,
    ready: Arc<Mutex<HashSet<String>>>,
    broadcaster: Arc<Broadcaster>,
    state: watch::Sender<ClusterState>,
    stopping: Arc<AtomicBool>,
}

impl Pump {
    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(message) = inbound.recv().await {
            match message {
                Inbound::Frame(name, frame) => self.on_frame(name, frame),
                Inbound::Closed(name) => self.on_closed(name),
            }
        }
    }

    fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), ClusterState::Ready)
    }

    fn fail(&self, error: PluginError) {
        let error = Arc::new(error);
        self.state.send_if_modified(|state| {
            if matches!(state, ClusterState::Starting) {
                *state = ClusterState::Failed(error.clone());
                true
            } else {
                false
            }
        });
    }

    fn on_frame(&mut self, name: String, frame: Frame) {
        match frame {
            Frame::Attached { .. } => {
                debug!(container = %name, "Container attached");
                self.attached.insert(name.clone());
                self.broadcaster
                    .broadcast(&BroadcastMessage::ContainerStarting { container: name });
                if !self.started && self.expected.iter().all(|n| self.attached.contains(n)) {
                    self.started = true;
                    info!(containers = self.expected.len(), "All containers attached, starting");
                    self.broadcaster.send_all(Frame::Start);
                }
            }
            Frame::Broadcast(message) => {
                debug!(container = %name, kind = message.kind(), "Broadcast");
                let ready_container = match &message {
                    BroadcastMessage::ContainerReady { container } => Some(container.clone()),
                    _ => None,
                };
                self.broadcaster.broadcast(&message);
                if let Some(container) = ready_container {
                    self.on_container_ready(container);
                }
            }
            Frame::Failed { reason, .. } => {
                error!(container = %name, reason = %reason, "Container failed");
                if !self.is_ready() {
                    self.fail(PluginError::ContainerFailed {
                        container: name,
                        reason,
                    });
                }
            }
            other => warn!(container = %name, frame = ?other, "Unexpected frame from container"),
        }
    }

    fn on_container_ready(&mut self, container: String) {
        info!(container = %container, "Container ready");
        let all_ready = {
            let mut ready = self.ready.lock();
            ready.insert(container);
            self.expected.iter().all(|n| ready.contains(n))
        };
        if all_ready && !self.is_ready() {
            self.broadcaster.broadcast(&BroadcastMessage::ContainersDone);
            let promoted = self.state.send_if_modified(|state| {
                if matches!(state, ClusterState::Starting) {
                    *state = ClusterState::Ready;
                    true
                } else {
                    false
                }
            });
            if promoted {
                info!("All containers ready");
            }
        }
    }

    fn on_closed(&mut self, name: String) {
        self.broadcaster.detach(&name);
        if self.stopping.load(Ordering::SeqCst) {
            debug!(container = %name, "Container link closed");
            return;
        }

        let reason = "link closed".to_string();
        error!(container = %name, "Container died");
        self.broadcaster
            .broadcast(&BroadcastMessage::ContainerDied {
                container: name.clone(),
                reason: reason.clone(),
            });
        if !self.is_ready() {
            self.fail(PluginError::ContainerDied {
                container: name,
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use cairn_core::{PluginEntry, Provided, Service, sync_setup};

    fn template(name: &str, provides: &[&str], consumes: &[&str]) -> PluginDescriptor {
        let provides: Vec<String> = provides.iter().map(|s| s.to_string()).collect();
        let owned = provides.clone();
        PluginDescriptor::new(name)
            .provides(provides)
            .consumes(consumes.iter().copied())
            .with_setup(sync_setup(move |_ctx| {
                let mut provided = Provided::new();
                for service in &owned {
                    provided.insert(service.clone(), Service::new(()));
                }
                Ok(provided)
            }))
    }

    fn catalog() -> PluginCatalog {
        PluginCatalog::new()
            .with(template("db", &["db"], &[]))
            .with(template("users", &["users"], &["db", "hub"]))
            .with(template("web", &["web"], &["users"]))
            .with(template("db-copy", &["db"], &[]))
    }

    fn config(containers: &[(&str, &[&str])]) -> CairnConfig {
        CairnConfig {
            containers: containers
                .iter()
                .map(|(name, plugins)| ContainerConfig {
                    name: name.to_string(),
                    plugins: plugins.iter().map(|p| PluginEntry::from(*p)).collect(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_listen_and_remote() {
        let plan = ClusterPlan::new(
            &config(&[("front", &["web"]), ("back", &["db", "users"])]),
            &catalog(),
        )
        .unwrap();

        assert_eq!(plan.master(), "front");
        let front = plan.get("front").unwrap();
        assert!(!front.listen);
        assert_eq!(front.remote_services, vec!["users".to_string()]);

        let back = plan.get("back").unwrap();
        assert!(back.listen);
        assert!(back.remote_services.is_empty());
    }

    #[test]
    fn test_plan_missing_service() {
        let err = ClusterPlan::new(&config(&[("front", &["web"])]), &catalog()).unwrap_err();
        let plugin = err.as_plugin_error().unwrap();
        assert!(plugin.is_preflight());
        assert!(err.to_string().contains("Missing services: users"));
    }

    #[test]
    fn test_plan_duplicate_across_containers() {
        let err = ClusterPlan::new(
            &config(&[("a", &["db"]), ("b", &["db-copy"])]),
            &catalog(),
        )
        .unwrap_err();
        assert!(matches!(
            err.as_plugin_error(),
            Some(PluginError::DuplicateService { plugin, service }) if plugin == "db-copy" && service == "db"
        ));
    }

    #[test]
    fn test_plan_unknown_plugin() {
        let err = ClusterPlan::new(&config(&[("a", &["nope"])]), &catalog()).unwrap_err();
        assert!(matches!(
            err.as_plugin_error(),
            Some(PluginError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn test_plan_requires_containers() {
        let err = ClusterPlan::new(&CairnConfig::default(), &catalog()).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }
}
