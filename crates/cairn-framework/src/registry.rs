//! The per-process service registry.

use std::collections::HashMap;

use cairn_core::{HUB_SERVICE, Hub, PluginError, PluginResult, Service};

/// Owner recorded for the pre-registered hub.
pub const ENGINE_OWNER: &str = "cairn";

struct Registration {
    service: Service,
    owner: String,
}

/// Maps service names to the services plugins registered.
///
/// A name is written at most once; a second registration is a
/// [`PluginError::DuplicateService`] and leaves the first value in place.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: HashMap<String, Registration>,
    order: Vec<String>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `hub` pre-registered.
    pub fn with_hub(hub: &Hub) -> Self {
        let mut registry = Self::new();
        registry.entries.insert(
            HUB_SERVICE.to_string(),
            Registration {
                service: Service::new(hub.clone()),
                owner: ENGINE_OWNER.to_string(),
            },
        );
        registry.order.push(HUB_SERVICE.to_string());
        registry
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the service registered under `name`.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.entries.get(name).map(|r| &r.service)
    }

    /// Returns the package path of the plugin that registered `name`.
    pub fn owner(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|r| r.owner.as_str())
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Number of registered services, including the hub.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fails with [`PluginError::DuplicateService`] if any of `names` is
    /// already taken.
    pub fn ensure_vacant<'a>(
        &self,
        plugin: &str,
        names: impl IntoIterator<Item = &'a str>,
    ) -> PluginResult<()> {
        for name in names {
            if self.contains(name) {
                return Err(PluginError::DuplicateService {
                    plugin: plugin.to_string(),
                    service: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Registers `service` under `name` on behalf of `plugin`.
    pub fn insert(&mut self, plugin: &str, name: &str, service: Service) -> PluginResult<()> {
        self.ensure_vacant(plugin, [name])?;
        self.entries.insert(
            name.to_string(),
            Registration {
                service,
                owner: plugin.to_string(),
            },
        );
        self.order.push(name.to_string());
        Ok(())
    }
}
