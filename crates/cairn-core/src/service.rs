//! Service handles, provided-service sets and imports.
//!
//! A [`Service`] is what a plugin registers under a name. In-process consumers
//! downcast it to the concrete type; consumers in another container only see
//! its [`ServiceInterface`], an explicit table of named operations taking and
//! returning JSON values. Remote stubs implement the same trait, so
//! [`Service::call`] works identically for local and remote services.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Calculator;
//!
//! #[async_trait]
//! impl ServiceInterface for Calculator {
//!     fn operations(&self) -> Vec<String> {
//!         vec!["add".into()]
//!     }
//!
//!     async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError> {
//!         match operation {
//!             "add" => Ok(json!(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0))),
//!             other => Err(format!("unknown operation {other}").into()),
//!         }
//!     }
//! }
//!
//! let provided = Provided::new().service("calculator", Service::with_interface(Calculator));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{BoxError, PluginError, PluginResult};
use crate::hub::{HUB_SERVICE, Hub};

// =============================================================================
// ServiceInterface
// =============================================================================

/// A named set of operations a service exposes across process boundaries.
#[async_trait]
pub trait ServiceInterface: Send + Sync {
    /// Names of the operations [`invoke`](Self::invoke) accepts.
    fn operations(&self) -> Vec<String>;

    /// Invokes `operation` with positional JSON arguments.
    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError>;
}

// =============================================================================
// Service
// =============================================================================

/// A cloneable handle to a registered service.
#[derive(Clone)]
pub struct Service {
    object: Option<Arc<dyn Any + Send + Sync>>,
    interface: Option<Arc<dyn ServiceInterface>>,
}

impl Service {
    /// Wraps a plain value. Only in-process consumers can use it.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wraps an already shared value.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        let object: Arc<dyn Any + Send + Sync> = value;
        Self {
            object: Some(object),
            interface: None,
        }
    }

    /// Wraps a value that also exposes an operation table.
    pub fn with_interface<T: ServiceInterface + Any>(value: T) -> Self {
        let value = Arc::new(value);
        let interface: Arc<dyn ServiceInterface> = value.clone();
        let object: Arc<dyn Any + Send + Sync> = value;
        Self {
            object: Some(object),
            interface: Some(interface),
        }
    }

    /// Wraps an interface with no local object behind it, such as a stub for
    /// a service living in another container.
    pub fn remote(interface: Arc<dyn ServiceInterface>) -> Self {
        Self {
            object: None,
            interface: Some(interface),
        }
    }

    /// Returns the concrete value if this is a local service of type `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.object.clone()?.downcast::<T>().ok()
    }

    /// Returns the operation table, if the service has one.
    pub fn interface(&self) -> Option<&Arc<dyn ServiceInterface>> {
        self.interface.as_ref()
    }

    /// Names of the operations exposed through the interface.
    pub fn operations(&self) -> Vec<String> {
        self.interface
            .as_ref()
            .map(|i| i.operations())
            .unwrap_or_default()
    }

    /// Returns `true` when no local object backs this service.
    pub fn is_remote(&self) -> bool {
        self.object.is_none()
    }

    /// Invokes an operation through the service's interface.
    pub async fn call(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError> {
        match &self.interface {
            Some(interface) => interface.invoke(operation, args).await,
            None => Err(format!("service does not expose operation '{operation}'").into()),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("remote", &self.is_remote())
            .field("operations", &self.operations())
            .finish()
    }
}

// =============================================================================
// Provided
// =============================================================================

/// Teardown returned alongside a plugin's services.
pub type Destructor = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// The set of services a plugin's setup hands back, plus an optional
/// destructor.
#[derive(Default)]
pub struct Provided {
    services: Vec<(String, Service)>,
    on_destroy: Option<Destructor>,
}

impl Provided {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service, builder style.
    pub fn service(mut self, name: impl Into<String>, service: Service) -> Self {
        self.insert(name, service);
        self
    }

    /// Adds or replaces a service.
    pub fn insert(&mut self, name: impl Into<String>, service: Service) {
        let name = name.into();
        match self.services.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = service,
            None => self.services.push((name, service)),
        }
    }

    /// Sets the teardown to run when the application is destroyed.
    pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_destroy = Some(Box::new(move || f().boxed()));
        self
    }

    /// Returns the named service.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services
            .iter()
            .find_map(|(n, s)| (n == name).then_some(s))
    }

    /// Returns `true` if a service with this name was provided.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names of the provided services, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|(n, _)| n.as_str())
    }

    /// Returns `true` if a destructor was set.
    pub fn has_destructor(&self) -> bool {
        self.on_destroy.is_some()
    }

    /// Splits into the service map and destructor.
    pub fn into_parts(self) -> (HashMap<String, Service>, Option<Destructor>) {
        (self.services.into_iter().collect(), self.on_destroy)
    }
}

impl fmt::Debug for Provided {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provided")
            .field("services", &self.names().collect::<Vec<_>>())
            .field("on_destroy", &self.has_destructor())
            .finish()
    }
}

// =============================================================================
// Imports
// =============================================================================

/// The services injected into a plugin's setup: exactly the ones it consumes.
#[derive(Clone, Default, Debug)]
pub struct Imports {
    services: HashMap<String, Service>,
}

impl Imports {
    /// Creates an empty import set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service.
    pub fn insert(&mut self, name: impl Into<String>, service: Service) {
        self.services.insert(name.into(), service);
    }

    /// Returns the named service.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Returns the named service or a [`PluginError::ServiceNotFound`].
    pub fn require(&self, name: &str) -> PluginResult<&Service> {
        self.get(name).ok_or_else(|| PluginError::not_found(name))
    }

    /// Downcasts the named service to `T`.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.downcast::<T>()
    }

    /// Returns the notification bus, if the plugin consumes `hub`.
    pub fn hub(&self) -> Option<Hub> {
        self.get_as::<Hub>(HUB_SERVICE).map(|hub| (*hub).clone())
    }

    /// Returns `true` if the named service was injected.
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Names of all injected services.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Number of injected services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` if nothing was injected.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
