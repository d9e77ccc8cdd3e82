//! Plugin lifecycle orchestration.
//!
//! [`PluginManager`] owns one process's plugins and services. It:
//!
//! - Resolves each plugin batch into a start order before anything runs.
//!   Validation and resolution errors abort the batch with no side effects.
//! - Starts plugins **one at a time** in that order, injecting exactly the
//!   services each one consumes and waiting for its setup to finish.
//! - Validates what a setup returns: every declared service must be present
//!   and no name may already be registered. Only then are the services
//!   inserted, the destructor captured and the hub notified.
//! - Emits [`AppEvent::Ready`] once when the initial batch is up and
//!   [`AppEvent::ReadyAdditional`] for every hot-loaded batch.
//! - Runs captured destructors in capture order on [`destroy`](PluginManager::destroy).
//!
//! # Driver
//!
//! Work is an explicit queue of batches drained by a single driver task.
//! Starting a batch or releasing parked plugins only enqueues work and wakes
//! the driver if it is idle, so a setup that hot-loads more plugins never
//! recurses into the start loop. Batches never interleave: a batch starts
//! only once every earlier batch has finished or failed.
//!
//! # Parking
//!
//! With a [`ServiceDirectory`] attached (container mode), a plugin whose
//! consumes live in another process is parked until the directory can hand out
//! stubs for them. [`release_parked`](PluginManager::release_parked) re-checks
//! parked plugins; the driver also re-checks after every local registration.
//!
//! # Example
//!
//! ```rust,ignore
//! use cairn_framework::manager::{EngineOptions, PluginManager};
//!
//! let manager = PluginManager::new(EngineOptions::default());
//! manager.start(descriptors).await?;
//! let db = manager.get_service("db")?;
//! // …later…
//! manager.destroy().await;
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use cairn_core::{
    AppEvent, Destructor, DescriptorField, Hub, Imports, PluginDescriptor, PluginError,
    PluginResult, Provided, Service, SetupContext, SharedError, resolve,
};

use crate::registry::ServiceRegistry;

// =============================================================================
// States
// =============================================================================

/// Lifecycle state of one plugin.
///
/// ```text
/// enqueued ──► Pending ──► Starting ──► Registered
///                 │            └──────► Failed
///                 └──► Parked (consumes not yet announced) ──► Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Waiting for its turn in the start order.
    Pending,
    /// Waiting for services provided by another container.
    Parked,
    /// Its setup is running.
    Starting,
    /// Its services are registered.
    Registered,
    /// Its setup failed or returned an invalid service set.
    Failed,
}

/// Lifecycle state of the whole application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// The initial batch is still starting.
    Initializing,
    /// The initial batch is up.
    Ready,
    /// At least one hot-loaded batch is up.
    ReadyAdditional,
    /// The initial batch failed.
    Failed,
    /// [`PluginManager::destroy`] was called.
    Destroyed,
}

// =============================================================================
// Options and hooks
// =============================================================================

/// Tunables for a [`PluginManager`].
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Upper bound on a single plugin's setup. Unbounded when `None`.
    pub setup_timeout: Option<Duration>,
}

impl EngineOptions {
    /// Bounds every plugin's setup by `timeout`.
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = Some(timeout);
        self
    }
}

/// Knowledge about services living in other processes.
pub trait ServiceDirectory: Send + Sync {
    /// Returns `true` if `name` is (or will be) provided by another process.
    fn is_remote(&self, name: &str) -> bool;

    /// Returns a stub for `name` once its provider has been announced.
    fn remote_service(&self, name: &str) -> Option<Service>;

    /// Returns why `name` can never be reached from this process, if its
    /// provider announced it in a form that cannot be called.
    fn unreachable(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Completion handle for a batch of plugins.
///
/// Awaiting is optional; dropping the handle does not cancel the batch.
#[derive(Debug)]
pub struct BatchHandle {
    id: u64,
    rx: oneshot::Receiver<Result<(), SharedError>>,
}

impl BatchHandle {
    /// Sequence number of the batch.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits until every plugin of the batch is registered or the batch fails.
    ///
    /// Do not await this from inside a setup: the batch cannot start before
    /// the current one finishes.
    pub async fn wait(self) -> Result<(), SharedError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Arc::new(PluginError::Destroyed)))
    }
}

// =============================================================================
// Internal bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Initial,
    Additional,
}

struct Batch {
    id: u64,
    kind: BatchKind,
    queue: VecDeque<PluginDescriptor>,
    parked: Vec<PluginDescriptor>,
    done: Option<oneshot::Sender<Result<(), SharedError>>>,
}

/// What [`Inner::register`] did with a finished setup.
enum Registration {
    Registered,
    /// The application was destroyed while the setup ran.
    Discarded(Option<Destructor>),
}

#[derive(Default)]
struct PluginTable {
    states: HashMap<String, PluginState>,
    /// Package paths in registration order.
    order: Vec<String>,
}

struct Inner {
    hub: Hub,
    options: EngineOptions,
    directory: Option<Arc<dyn ServiceDirectory>>,
    registry: RwLock<ServiceRegistry>,
    batches: Mutex<VecDeque<Batch>>,
    plugins: RwLock<PluginTable>,
    destructors: Mutex<Vec<(String, Destructor)>>,
    driving: AtomicBool,
    started: AtomicBool,
    destroyed: AtomicBool,
    next_batch: AtomicU64,
    status: watch::Sender<SystemState>,
    failure: Mutex<Option<SharedError>>,
}

// =============================================================================
// PluginManager
// =============================================================================

/// Per-process orchestrator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

impl PluginManager {
    /// Creates a single-process manager.
    pub fn new(options: EngineOptions) -> Self {
        Self::build(options, None)
    }

    /// Creates a manager that can park plugins on services from other
    /// processes.
    pub fn with_directory(options: EngineOptions, directory: Arc<dyn ServiceDirectory>) -> Self {
        Self::build(options, Some(directory))
    }

    fn build(options: EngineOptions, directory: Option<Arc<dyn ServiceDirectory>>) -> Self {
        let hub = Hub::new();
        let (status, _) = watch::channel(SystemState::Initializing);
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(ServiceRegistry::with_hub(&hub)),
                hub,
                options,
                directory,
                batches: Mutex::new(VecDeque::new()),
                plugins: RwLock::new(PluginTable::default()),
                destructors: Mutex::new(Vec::new()),
                driving: AtomicBool::new(false),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                next_batch: AtomicU64::new(0),
                status,
                failure: Mutex::new(None),
            }),
        }
    }

    // ─── Observation ─────────────────────────────────────────────────────────

    /// The notification bus, also registered as the `hub` service.
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AppEvent> {
        self.inner.hub.subscribe()
    }

    /// Current system state.
    pub fn state(&self) -> SystemState {
        *self.inner.status.borrow()
    }

    /// Watches system state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SystemState> {
        self.inner.status.subscribe()
    }

    /// The error that failed the initial batch, if any.
    pub fn failure(&self) -> Option<SharedError> {
        self.inner.failure.lock().clone()
    }

    /// Waits until the initial batch is up, or returns its error.
    pub async fn wait_ready(&self) -> Result<(), SharedError> {
        let mut rx = self.inner.status.subscribe();
        let state = *rx
            .wait_for(|s| *s != SystemState::Initializing)
            .await
            .map_err(|_| Arc::new(PluginError::Destroyed))?;
        match state {
            SystemState::Failed => Err(self
                .failure()
                .unwrap_or_else(|| Arc::new(PluginError::Destroyed))),
            SystemState::Destroyed => Err(Arc::new(PluginError::Destroyed)),
            _ => Ok(()),
        }
    }

    /// State of the named plugin, or `None` if it was never enqueued.
    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.inner.plugins.read().states.get(name).copied()
    }

    /// Registered plugins in start order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.read().order.clone()
    }

    /// Returns the registered service, for host use.
    pub fn get_service(&self, name: &str) -> PluginResult<Service> {
        self.inner
            .registry
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::not_found(name))
    }

    /// Package path of the plugin that registered `name`.
    pub fn service_owner(&self, name: &str) -> Option<String> {
        self.inner.registry.read().owner(name).map(str::to_string)
    }

    /// Registered service names in registration order, starting with `hub`.
    pub fn services(&self) -> Vec<String> {
        self.inner.registry.read().names().to_vec()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Resolves and starts the initial plugin set, returning once it is ready
    /// or has failed.
    ///
    /// A second call is treated as a hot-load.
    pub async fn start(&self, descriptors: Vec<PluginDescriptor>) -> Result<(), SharedError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Manager already started, loading plugins as an additional batch");
            return self.load_additional_plugins(descriptors)?.wait().await;
        }

        let sorted = match &self.inner.directory {
            Some(directory) => {
                let remote = |name: &str| directory.is_remote(name);
                resolve(&descriptors, Some(&remote))
            }
            None => resolve(&descriptors, None),
        };

        let sorted = match sorted {
            Ok(sorted) => sorted,
            Err(e) => {
                let e = Arc::new(e);
                error!(error = %e, "Plugin configuration rejected");
                self.inner.fail_system(e.clone());
                return Err(e);
            }
        };

        info!(plugins = sorted.len(), "Dependency graph resolved");
        let handle = self.inner.enqueue(BatchKind::Initial, sorted);
        self.kick();
        handle.wait().await
    }

    /// Adds plugins to a running (or still starting) application.
    ///
    /// The batch is resolved against the live registry, services still to be
    /// provided by queued plugins, and remote services. It starts right away
    /// when the manager is idle and otherwise after the work already queued.
    pub fn load_additional_plugins(
        &self,
        descriptors: Vec<PluginDescriptor>,
    ) -> Result<BatchHandle, SharedError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Arc::new(PluginError::Destroyed));
        }

        let pending = self.inner.pending_provides();
        let sorted = {
            let registry = self.inner.registry.read();
            let lookup = |name: &str| {
                registry.contains(name)
                    || pending.contains(name)
                    || self.inner.is_remote(name)
            };
            resolve(&descriptors, Some(&lookup))
        };

        let sorted = sorted.map_err(|e| {
            let e = Arc::new(e);
            error!(error = %e, "Additional plugins rejected");
            self.inner.hub.emit(AppEvent::Error(e.clone()));
            e
        })?;

        info!(plugins = sorted.len(), "Additional plugins queued");
        let handle = self.inner.enqueue(BatchKind::Additional, sorted);
        self.kick();
        Ok(handle)
    }

    /// Re-checks parked plugins and starts those whose services are now
    /// available.
    pub fn release_parked(&self) {
        let released = self.inner.release_parked();
        if released > 0 {
            debug!(released, "Parked plugins released");
        }
        // A failed batch may have unblocked the ones queued behind it.
        if self.inner.has_runnable() {
            self.kick();
        }
    }

    /// Runs every captured destructor in capture order. Idempotent.
    ///
    /// Queued batches are dropped; their handles resolve to
    /// [`PluginError::Destroyed`].
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Application already destroyed");
            return;
        }

        self.inner.batches.lock().clear();
        let destructors = std::mem::take(&mut *self.inner.destructors.lock());
        info!(destructors = destructors.len(), "Destroying application");

        for (plugin, destructor) in destructors {
            if let Err(e) = destructor().await {
                warn!(plugin = %plugin, error = %e, "Plugin destructor failed");
            }
        }

        self.inner.status.send_replace(SystemState::Destroyed);
    }

    /// Wakes the driver unless it is already running.
    fn kick(&self) {
        if !self.inner.driving.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.drive());
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("state", &self.state())
            .field("services", &self.services())
            .finish()
    }
}

// =============================================================================
// Driver
// =============================================================================

impl Inner {
    async fn drive(self: Arc<Self>) {
        loop {
            match self.next_plugin() {
                Some((batch, descriptor)) => self.run_plugin(batch, descriptor).await,
                None => {
                    self.driving.store(false, Ordering::SeqCst);
                    // Work enqueued after the check above would otherwise be
                    // left with no driver.
                    if !self.has_runnable() || self.driving.swap(true, Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }

    fn enqueue(&self, kind: BatchKind, sorted: Vec<PluginDescriptor>) -> BatchHandle {
        let id = self.next_batch.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut plugins = self.plugins.write();
            for desc in &sorted {
                plugins
                    .states
                    .insert(desc.package_path.clone(), PluginState::Pending);
            }
        }
        self.batches.lock().push_back(Batch {
            id,
            kind,
            queue: sorted.into(),
            parked: Vec::new(),
            done: Some(tx),
        });
        BatchHandle { id, rx }
    }

    /// Pops the next plugin of the front batch, settling finished batches on
    /// the way.
    fn next_plugin(&self) -> Option<(u64, PluginDescriptor)> {
        let mut batches = self.batches.lock();
        loop {
            if self.destroyed.load(Ordering::SeqCst) {
                batches.clear();
                return None;
            }
            let batch = batches.front_mut()?;
            if let Some(desc) = batch.queue.pop_front() {
                return Some((batch.id, desc));
            }
            if !batch.parked.is_empty() {
                return None;
            }
            if let Some(finished) = batches.pop_front() {
                self.complete_batch(finished);
            }
        }
    }

    fn has_runnable(&self) -> bool {
        self.batches
            .lock()
            .front()
            .is_some_and(|b| !b.queue.is_empty() || b.parked.is_empty())
    }

    async fn run_plugin(&self, batch: u64, desc: PluginDescriptor) {
        let name = desc.package_path.clone();

        let imports = match self.collect_imports(&desc) {
            Ok(imports) => imports,
            Err(missing) => {
                if missing.iter().all(|service| self.is_awaited(service)) {
                    debug!(plugin = %name, waiting_for = ?missing, "Plugin parked");
                    self.set_plugin_state(&name, PluginState::Parked);
                    self.park(batch, desc);
                    // An announcement may have landed since collect_imports.
                    self.release_parked();
                } else {
                    self.set_plugin_state(&name, PluginState::Failed);
                    self.fail_batch(batch, PluginError::not_found(missing[0].clone()));
                }
                return;
            }
        };

        match self.start_plugin(&desc, imports).await {
            Ok(()) => {
                self.release_parked();
            }
            Err(e) => {
                self.set_plugin_state(&name, PluginState::Failed);
                self.fail_batch(batch, e);
            }
        }
    }

    /// Builds the imports for `desc`, or returns the consumes not available
    /// yet.
    fn collect_imports(&self, desc: &PluginDescriptor) -> Result<Imports, Vec<String>> {
        let registry = self.registry.read();
        let mut imports = Imports::new();
        let mut missing = Vec::new();

        for name in desc.consumed() {
            if let Some(service) = registry.get(name) {
                imports.insert(name.clone(), service.clone());
            } else if let Some(stub) = self
                .directory
                .as_ref()
                .and_then(|d| d.remote_service(name))
            {
                imports.insert(name.clone(), stub);
            } else {
                missing.push(name.clone());
            }
        }

        if missing.is_empty() {
            Ok(imports)
        } else {
            Err(missing)
        }
    }

    async fn start_plugin(&self, desc: &PluginDescriptor, imports: Imports) -> PluginResult<()> {
        let name = desc.name();
        let Some(setup) = desc.setup.clone() else {
            return Err(PluginError::InvalidDescriptor {
                plugin: name.to_string(),
                field: DescriptorField::Setup,
            });
        };

        self.set_plugin_state(name, PluginState::Starting);
        info!(plugin = %name, consumes = ?desc.consumed(), "Starting plugin");

        let ctx = SetupContext::new(name, desc.options.clone(), imports);
        let setup_future = AssertUnwindSafe(setup.setup(ctx))
            .catch_unwind()
            .instrument(info_span!("setup", plugin = %name));

        let outcome = match self.options.setup_timeout {
            Some(limit) => match tokio::time::timeout(limit, setup_future).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(PluginError::SetupTimeout {
                        plugin: name.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => setup_future.await,
        };

        let provided = match outcome {
            Ok(result) => result.map_err(|e| PluginError::setup_failed(name, e))?,
            Err(payload) => {
                return Err(PluginError::setup_failed(name, panic_message(payload.as_ref())));
            }
        };

        match self.register(desc, provided)? {
            Registration::Registered => Ok(()),
            Registration::Discarded(destructor) => {
                info!(plugin = %name, "Application destroyed during setup, discarding plugin");
                if let Some(destructor) = destructor
                    && let Err(e) = destructor().await
                {
                    warn!(plugin = %name, error = %e, "Plugin destructor failed");
                }
                Err(PluginError::Destroyed)
            }
        }
    }

    /// Validates and registers a finished plugin's services.
    ///
    /// Once the application is destroyed nothing is registered and the
    /// destructor is handed back to the caller instead.
    fn register(&self, desc: &PluginDescriptor, provided: Provided) -> PluginResult<Registration> {
        let name = desc.name();
        let declared = desc.provided();
        let (mut services, destructor) = provided.into_parts();

        // Held until the destructor is captured so destroy() cannot drain the
        // list in between.
        let mut destructors = self.destructors.lock();
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(Registration::Discarded(destructor));
        }

        if let Some(service) = declared.iter().find(|s| !services.contains_key(s.as_str())) {
            return Err(PluginError::ProvideMismatch {
                plugin: name.to_string(),
                service: service.clone(),
            });
        }

        let undeclared: Vec<&String> = services.keys().filter(|s| !declared.contains(s)).collect();
        if !undeclared.is_empty() {
            warn!(plugin = %name, undeclared = ?undeclared, "Ignoring services the plugin did not declare");
        }

        {
            let mut registry = self.registry.write();
            registry.ensure_vacant(name, declared.iter().map(String::as_str))?;
            for service_name in declared {
                if let Some(service) = services.remove(service_name) {
                    registry.insert(name, service_name, service)?;
                }
            }
        }

        if let Some(destructor) = destructor {
            destructors.push((name.to_string(), destructor));
        }
        drop(destructors);
        {
            let mut plugins = self.plugins.write();
            plugins
                .states
                .insert(name.to_string(), PluginState::Registered);
            plugins.order.push(name.to_string());
        }

        info!(plugin = %name, services = ?declared, "Plugin registered");
        for service_name in declared {
            self.hub.emit(AppEvent::Service {
                name: service_name.clone(),
            });
        }
        self.hub.emit(AppEvent::Plugin {
            name: name.to_string(),
        });
        Ok(Registration::Registered)
    }

    // ─── Parking ─────────────────────────────────────────────────────────────

    fn is_remote(&self, name: &str) -> bool {
        self.directory.as_ref().is_some_and(|d| d.is_remote(name))
    }

    /// Returns `true` if `name` is expected to appear later: provided by
    /// another process or by a plugin that is itself parked.
    fn is_awaited(&self, name: &str) -> bool {
        self.is_remote(name)
            || self.batches.lock().iter().any(|b| {
                b.parked
                    .iter()
                    .any(|d| d.provided().iter().any(|p| p == name))
            })
    }

    fn park(&self, batch: u64, desc: PluginDescriptor) {
        let mut batches = self.batches.lock();
        if let Some(b) = batches.iter_mut().find(|b| b.id == batch) {
            b.parked.push(desc);
        }
    }

    /// Moves parked plugins whose consumes are now all available back to the
    /// head of the queue, keeping their relative order.
    ///
    /// A parked plugin waiting on a service the directory reports as
    /// unreachable fails its batch instead.
    fn release_parked(&self) -> usize {
        let unreachable = {
            let mut batches = self.batches.lock();
            let Some(batch) = batches.front_mut() else {
                return 0;
            };
            if batch.parked.is_empty() {
                return 0;
            }

            let unreachable = self.directory.as_ref().and_then(|directory| {
                batch.parked.iter().find_map(|d| {
                    d.consumed().iter().find_map(|service| {
                        directory
                            .unreachable(service)
                            .map(|reason| (d.package_path.clone(), service.clone(), reason))
                    })
                })
            });

            match unreachable {
                Some(found) => (batch.id, found),
                None => {
                    let registry = self.registry.read();
                    let available = |name: &String| {
                        registry.contains(name)
                            || self
                                .directory
                                .as_ref()
                                .is_some_and(|d| d.remote_service(name).is_some())
                    };
                    let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut batch.parked)
                        .into_iter()
                        .partition(|d| d.consumed().iter().all(available));
                    batch.parked = waiting;

                    let released = ready.len();
                    for desc in ready.into_iter().rev() {
                        batch.queue.push_front(desc);
                    }
                    return released;
                }
            }
        };

        let (batch, (plugin, service, reason)) = unreachable;
        self.set_plugin_state(&plugin, PluginState::Failed);
        self.fail_batch(batch, PluginError::remote(service, "*", reason));
        0
    }

    /// Services still to be provided by queued or parked plugins.
    fn pending_provides(&self) -> HashSet<String> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.queue.iter().chain(b.parked.iter()))
            .flat_map(|d| d.provided().iter().cloned())
            .collect()
    }

    // ─── Outcomes ────────────────────────────────────────────────────────────

    fn set_plugin_state(&self, name: &str, state: PluginState) {
        self.plugins.write().states.insert(name.to_string(), state);
    }

    fn complete_batch(&self, mut batch: Batch) {
        match batch.kind {
            BatchKind::Initial => {
                info!(batch = batch.id, "All plugins started");
                self.status.send_replace(SystemState::Ready);
                self.hub.emit(AppEvent::Ready);
            }
            BatchKind::Additional => {
                info!(batch = batch.id, "Additional plugins started");
                self.status.send_if_modified(|state| {
                    let promote = matches!(state, SystemState::Ready);
                    if promote {
                        *state = SystemState::ReadyAdditional;
                    }
                    promote
                });
                self.hub.emit(AppEvent::ReadyAdditional);
            }
        }
        if let Some(done) = batch.done.take() {
            let _ = done.send(Ok(()));
        }
    }

    fn fail_batch(&self, batch_id: u64, error: PluginError) {
        let error = Arc::new(error);

        let batch = {
            let mut batches = self.batches.lock();
            if batches.front().is_some_and(|b| b.id == batch_id) {
                batches.pop_front()
            } else {
                None
            }
        };
        let Some(mut batch) = batch else {
            debug!(batch = batch_id, error = %error, "Batch already dropped");
            return;
        };
        error!(batch = batch_id, error = %error, "Plugin start aborted");

        if batch.kind == BatchKind::Initial {
            self.fail_system(error.clone());
        } else {
            self.hub.emit(AppEvent::Error(error.clone()));
        }
        if let Some(done) = batch.done.take() {
            let _ = done.send(Err(error));
        }
    }

    fn fail_system(&self, error: SharedError) {
        *self.failure.lock() = Some(error.clone());
        self.status.send_replace(SystemState::Failed);
        self.hub.emit(AppEvent::Error(error));
    }
}

/// Text of a panic payload raised by `panic!` with a literal or formatted
/// message.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match message {
        Some(message) => format!("setup panicked: {message}"),
        None => "setup panicked".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use cairn_core::{BoxError, callback_setup, setup_fn, sync_setup};

    type Log = Arc<Mutex<Vec<String>>>;

    /// A plugin that records its start, checks it sees exactly its consumes
    /// and provides a `u32` per declared service.
    fn plugin(log: &Log, name: &str, provides: &[&str], consumes: &[&str]) -> PluginDescriptor {
        let log = Arc::clone(log);
        let plugin_name = name.to_string();
        let provide_names: Vec<String> = provides.iter().map(|s| s.to_string()).collect();
        let consume_names: Vec<String> = consumes.iter().map(|s| s.to_string()).collect();
        PluginDescriptor::new(name)
            .provides(provides.iter().copied())
            .consumes(consumes.iter().copied())
            .setup(sync_setup(move |ctx| {
                assert_eq!(ctx.imports().len(), consume_names.len());
                for c in &consume_names {
                    assert!(ctx.imports().contains(c), "{c} not injected");
                }
                log.lock().push(plugin_name.clone());
                let mut provided = Provided::new();
                for (i, p) in provide_names.iter().enumerate() {
                    provided.insert(p.clone(), Service::new(i as u32));
                }
                Ok(provided)
            }))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_in_dependency_order() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let mut events = manager.subscribe();

        manager
            .start(vec![
                plugin(&log, "web", &["web"], &["db", "cache"]),
                plugin(&log, "cache", &["cache"], &["db"]),
                plugin(&log, "db", &["db"], &[]),
            ])
            .await
            .unwrap();

        assert_eq!(*log.lock(), ["db", "cache", "web"]);
        assert_eq!(manager.plugin_names(), ["db", "cache", "web"]);
        assert_eq!(manager.state(), SystemState::Ready);
        assert_eq!(manager.service_owner("cache").as_deref(), Some("cache"));
        assert_eq!(manager.services(), ["hub", "db", "cache", "web"]);

        let events = drain(&mut events);
        let ready = events
            .iter()
            .filter(|e| matches!(e, AppEvent::Ready))
            .count();
        assert_eq!(ready, 1);
        assert!(matches!(events.last(), Some(AppEvent::Ready)));
        assert!(matches!(&events[0], AppEvent::Service { name } if name == "db"));
        assert!(matches!(&events[1], AppEvent::Plugin { name } if name == "db"));
    }

    #[tokio::test]
    async fn test_provide_mismatch() {
        let manager = PluginManager::new(EngineOptions::default());
        let bar = PluginDescriptor::new("bar")
            .provides(["bar.plugin"])
            .setup(sync_setup(|_| Ok(Provided::new())));

        let err = manager.start(vec![bar]).await.unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Plugin failed to provide bar.plugin service")
        );
        assert_eq!(manager.plugin_state("bar"), Some(PluginState::Failed));
        assert_eq!(manager.state(), SystemState::Failed);
        assert!(manager.get_service("bar.plugin").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_service_keeps_first() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let second = PluginDescriptor::new("second")
            .provides(["db"])
            .setup(sync_setup(|_| {
                Ok(Provided::new().service("db", Service::new(99_u32)))
            }));

        let err = manager
            .start(vec![plugin(&log, "first", &["db"], &[]), second])
            .await
            .unwrap_err();

        assert!(matches!(*err, PluginError::DuplicateService { .. }));
        let db = manager.get_service("db").unwrap();
        assert_eq!(*db.downcast::<u32>().unwrap(), 0);
        assert_eq!(manager.service_owner("db").as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_remaining() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let mut events = manager.subscribe();
        let broken = PluginDescriptor::new("broken")
            .provides(["broken"])
            .setup(sync_setup(|_| Err("connection refused".into())));

        let err = manager
            .start(vec![
                plugin(&log, "a", &["a"], &[]),
                broken,
                plugin(&log, "b", &[], &["broken"]),
            ])
            .await
            .unwrap_err();

        assert!(matches!(*err, PluginError::SetupFailed { ref plugin, .. } if plugin == "broken"));
        assert_eq!(*log.lock(), ["a"]);
        assert_eq!(manager.plugin_state("a"), Some(PluginState::Registered));
        assert_eq!(manager.plugin_state("b"), Some(PluginState::Pending));
        assert_eq!(manager.wait_ready().await.unwrap_err().to_string(), err.to_string());

        let errors = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_resolution_error_runs_nothing() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let err = manager
            .start(vec![
                plugin(&log, "ok", &["ok"], &[]),
                plugin(&log, "a", &["a"], &["b"]),
                plugin(&log, "b", &["b"], &["a"]),
            ])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Config contains cyclic dependencies"));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_runs_in_capture_order_once() {
        let order = Log::default();
        let manager = PluginManager::new(EngineOptions::default());

        let mut descriptors = Vec::new();
        for (name, consumes) in [("x", vec![]), ("y", vec!["x"]), ("z", vec!["y"])] {
            let order = Arc::clone(&order);
            descriptors.push(
                PluginDescriptor::new(name)
                    .provides([name])
                    .consumes(consumes)
                    .setup(sync_setup(move |ctx| {
                        let order = Arc::clone(&order);
                        let name = ctx.plugin().to_string();
                        Ok(Provided::new()
                            .service(name.clone(), Service::new(()))
                            .on_destroy(move || async move {
                                order.lock().push(name);
                                Ok(())
                            }))
                    })),
            );
        }
        // Reverse the configuration so capture order differs from list order.
        descriptors.reverse();

        manager.start(descriptors).await.unwrap();
        manager.destroy().await;
        manager.destroy().await;

        assert_eq!(*order.lock(), ["x", "y", "z"]);
        assert_eq!(manager.state(), SystemState::Destroyed);
    }

    #[tokio::test]
    async fn test_failing_destructor_does_not_block_others() {
        let ran = Arc::new(AtomicUsize::new(0));
        let manager = PluginManager::new(EngineOptions::default());

        let failing = PluginDescriptor::new("failing").setup(sync_setup(|_| {
            Ok(Provided::new().on_destroy(|| async { Err::<(), BoxError>("disk full".into()) }))
        }));
        let counter = Arc::clone(&ran);
        let counting = PluginDescriptor::new("counting").setup(sync_setup(move |_| {
            let counter = Arc::clone(&counter);
            Ok(Provided::new().on_destroy(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
        }));

        manager.start(vec![failing, counting]).await.unwrap();
        manager.destroy().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hot_load_uses_live_registry() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let mut events = manager.subscribe();

        manager
            .start(vec![plugin(&log, "db", &["db"], &[])])
            .await
            .unwrap();
        manager
            .load_additional_plugins(vec![plugin(&log, "late", &["late"], &["db"])])
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(*log.lock(), ["db", "late"]);
        assert_eq!(manager.state(), SystemState::ReadyAdditional);
        let events = drain(&mut events);
        assert_eq!(events.iter().filter(|e| matches!(e, AppEvent::Ready)).count(), 1);
        assert!(matches!(events.last(), Some(AppEvent::ReadyAdditional)));
    }

    #[tokio::test]
    async fn test_hot_load_missing_service_rejected() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        manager.start(vec![]).await.unwrap();

        let err = manager
            .load_additional_plugins(vec![plugin(&log, "late", &[], &["ghost"])])
            .unwrap_err();
        assert!(err.to_string().contains("Missing services: ghost"));
        assert_eq!(manager.state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn test_hot_load_from_setup_waits_for_initial_batch() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());

        let loader = {
            let log = Arc::clone(&log);
            let manager = manager.clone();
            let late = plugin(&log, "late", &[], &["tail"]);
            PluginDescriptor::new("loader").setup(sync_setup(move |_| {
                log.lock().push("loader".into());
                manager
                    .load_additional_plugins(vec![late.clone()])
                    .map_err(|e| -> BoxError { e.to_string().into() })?;
                Ok(Provided::new())
            }))
        };

        let mut events = manager.subscribe();
        manager
            .start(vec![loader, plugin(&log, "tail", &["tail"], &[])])
            .await
            .unwrap();

        loop {
            if let Some(AppEvent::ReadyAdditional) = events.recv().await {
                break;
            }
        }
        assert_eq!(*log.lock(), ["loader", "tail", "late"]);
    }

    #[tokio::test]
    async fn test_callback_setup_is_awaited() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let slow = PluginDescriptor::new("slow")
            .provides(["slow"])
            .setup(callback_setup(|_ctx, register| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    register.ok(Provided::new().service("slow", Service::new(())));
                });
            }));

        manager
            .start(vec![slow, plugin(&log, "after", &[], &["slow"])])
            .await
            .unwrap();
        assert_eq!(*log.lock(), ["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout() {
        let manager = PluginManager::new(EngineOptions::default().setup_timeout(Duration::from_secs(5)));
        let stuck = PluginDescriptor::new("stuck").setup(setup_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BoxError>(Provided::new())
        }));

        let err = manager.start(vec![stuck]).await.unwrap_err();
        assert!(matches!(*err, PluginError::SetupTimeout { ref plugin, .. } if plugin == "stuck"));
    }

    #[tokio::test]
    async fn test_setup_panic_fails_plugin() {
        let log = Log::default();
        let manager = PluginManager::new(EngineOptions::default());
        let mut events = manager.subscribe();
        let bad = PluginDescriptor::new("bad")
            .provides(["bad"])
            .setup(sync_setup(|_| panic!("plugin bug")));

        let err = manager.start(vec![bad]).await.unwrap_err();
        match &*err {
            PluginError::SetupFailed { plugin, source } => {
                assert_eq!(plugin, "bad");
                assert_eq!(source.to_string(), "setup panicked: plugin bug");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.plugin_state("bad"), Some(PluginState::Failed));
        assert_eq!(manager.state(), SystemState::Failed);
        let errors = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);

        manager
            .load_additional_plugins(vec![plugin(&log, "later", &["later"], &[])])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(*log.lock(), ["later"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_finishing_after_destroy_is_discarded() {
        let ran = Arc::new(AtomicUsize::new(0));
        let manager = PluginManager::new(EngineOptions::default());
        let mut events = manager.subscribe();

        let counter = Arc::clone(&ran);
        let slow = PluginDescriptor::new("slow")
            .provides(["slow"])
            .setup(setup_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, BoxError>(
                        Provided::new()
                            .service("slow", Service::new(()))
                            .on_destroy(move || async move {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }),
                    )
                }
            }));

        let boot = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start(vec![slow]).await })
        };
        while manager.plugin_state("slow") != Some(PluginState::Starting) {
            tokio::task::yield_now().await;
        }

        manager.destroy().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let err = boot.await.unwrap().unwrap_err();
        assert!(matches!(*err, PluginError::Destroyed));

        tokio::time::timeout(Duration::from_secs(1), async {
            while ran.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(manager.get_service("slow").is_err());
        assert_eq!(manager.state(), SystemState::Destroyed);
        assert!(manager.plugin_names().is_empty());
        let late = drain(&mut events)
            .into_iter()
            .any(|e| matches!(e, AppEvent::Service { .. } | AppEvent::Plugin { .. }));
        assert!(!late);
    }

    #[tokio::test]
    async fn test_hub_service_injected() {
        let manager = PluginManager::new(EngineOptions::default());
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let watcher = PluginDescriptor::new("watcher")
            .consumes(["hub"])
            .setup(sync_setup(move |ctx| {
                flag.store(ctx.imports().hub().is_some(), Ordering::SeqCst);
                Ok(Provided::new())
            }));

        manager.start(vec![watcher]).await.unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_get_service_not_found() {
        let manager = PluginManager::new(EngineOptions::default());
        manager.start(vec![]).await.unwrap();
        let err = manager.get_service("nope").unwrap_err();
        assert_eq!(err.to_string(), "Service 'nope' not found");
    }

    // ─── Parking ─────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeDirectory {
        announced: Mutex<HashMap<String, Service>>,
        unreachable: Mutex<HashMap<String, String>>,
    }

    impl ServiceDirectory for FakeDirectory {
        fn is_remote(&self, name: &str) -> bool {
            name.starts_with("remote.")
        }

        fn remote_service(&self, name: &str) -> Option<Service> {
            self.announced.lock().get(name).cloned()
        }

        fn unreachable(&self, name: &str) -> Option<String> {
            self.unreachable.lock().get(name).cloned()
        }
    }

    #[tokio::test]
    async fn test_parked_until_remote_service_announced() {
        let log = Log::default();
        let directory = Arc::new(FakeDirectory::default());
        let manager = PluginManager::with_directory(EngineOptions::default(), directory.clone());

        let boot = {
            let manager = manager.clone();
            let plugins = vec![
                plugin(&log, "client", &["client"], &["remote.api"]),
                plugin(&log, "ui", &[], &["client"]),
                plugin(&log, "local", &["local"], &[]),
            ];
            tokio::spawn(async move { manager.start(plugins).await })
        };

        let mut state = manager.watch_state();
        while manager.plugin_state("local") != Some(PluginState::Registered) {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.plugin_state("client"), Some(PluginState::Parked));
        assert_eq!(manager.plugin_state("ui"), Some(PluginState::Parked));
        assert_eq!(*state.borrow_and_update(), SystemState::Initializing);

        directory
            .announced
            .lock()
            .insert("remote.api".into(), Service::new(()));
        manager.release_parked();

        boot.await.unwrap().unwrap();
        assert_eq!(*log.lock(), ["local", "client", "ui"]);
        assert_eq!(manager.state(), SystemState::Ready);
    }

    #[tokio::test]
    async fn test_unreachable_remote_service_fails_parked_plugin() {
        let log = Log::default();
        let directory = Arc::new(FakeDirectory::default());
        let manager = PluginManager::with_directory(EngineOptions::default(), directory.clone());
        let mut events = manager.subscribe();

        let boot = {
            let manager = manager.clone();
            let plugins = vec![
                plugin(&log, "client", &["client"], &["remote.db"]),
                plugin(&log, "local", &["local"], &[]),
            ];
            tokio::spawn(async move { manager.start(plugins).await })
        };

        while manager.plugin_state("local") != Some(PluginState::Registered)
            || manager.plugin_state("client") != Some(PluginState::Parked)
        {
            tokio::task::yield_now().await;
        }

        directory
            .unreachable
            .lock()
            .insert("remote.db".into(), "service has no interface".into());
        manager.release_parked();

        let err = boot.await.unwrap().unwrap_err();
        assert!(
            matches!(*err, PluginError::RemoteDispatch { ref service, ref reason, .. }
                if service == "remote.db" && reason == "service has no interface")
        );
        assert_eq!(manager.plugin_state("client"), Some(PluginState::Failed));
        assert_eq!(manager.state(), SystemState::Failed);
        assert_eq!(*log.lock(), ["local"]);
        let errors = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, AppEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }
}
