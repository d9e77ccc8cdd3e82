//! The plugin catalog: logical names mapped to descriptor templates.
//!
//! Configuration only names plugins; the catalog supplies their setup and
//! default `provides` / `consumes` metadata. Values written in configuration
//! override the catalog's metadata, and extra keys become setup options.
//!
//! ```rust,ignore
//! let catalog = PluginCatalog::new()
//!     .with(auth::descriptor())
//!     .with(calculator::descriptor());
//!
//! let entries: Vec<PluginEntry> = config.plugins.clone();
//! let descriptors = catalog.resolve_config(&entries)?;
//! ```

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use cairn_core::{PluginDescriptor, PluginEntry, PluginError, PluginResult};

/// Registry of every plugin a binary can start.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    templates: HashMap<String, PluginDescriptor>,
}

impl PluginCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template, builder style.
    pub fn with(mut self, descriptor: PluginDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Adds or replaces the template keyed by its package path.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> &mut Self {
        debug!(plugin = %descriptor.package_path, "Plugin added to catalog");
        self.templates
            .insert(descriptor.package_path.clone(), descriptor);
        self
    }

    /// Returns the template for `name`.
    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.templates.get(name)
    }

    /// Returns `true` if `name` is known.
    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Known package paths, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns `true` if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Builds the descriptor for one configuration entry.
    pub fn resolve_entry(&self, entry: &PluginEntry) -> PluginResult<PluginDescriptor> {
        let spec = entry.to_spec();
        let template = self
            .get(&spec.package_path)
            .ok_or_else(|| PluginError::UnknownPlugin {
                name: spec.package_path.clone(),
            })?;

        let mut descriptor = template.clone();
        if let Some(provides) = spec.provides {
            descriptor.provides = Some(provides);
        }
        if let Some(consumes) = spec.consumes {
            descriptor.consumes = Some(consumes);
        }
        if spec.version.is_some() {
            descriptor.version = spec.version;
        }
        if !spec.options.is_empty() {
            let mut options = match descriptor.options {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            options.extend(spec.options);
            descriptor.options = Value::Object(options);
        }
        descriptor.checked = false;
        Ok(descriptor)
    }

    /// Builds descriptors for a configuration list, preserving its order.
    pub fn resolve_config(&self, entries: &[PluginEntry]) -> PluginResult<Vec<PluginDescriptor>> {
        entries.iter().map(|e| self.resolve_entry(e)).collect()
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("plugins", &self.names())
            .finish()
    }
}
