//! Plugin descriptors and their configuration shape.
//!
//! A [`PluginDescriptor`] is the runtime form of one configured plugin: its
//! identity, the services it provides and consumes, and its setup. A
//! [`PluginEntry`] is the serializable form found in configuration files,
//! which a catalog turns into descriptors.
//!
//! ```toml
//! plugins = [
//!     "auth",
//!     { packagePath = "calculator", consumes = ["auth"], precision = 4 },
//! ]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::setup::{Setup, SharedSetup};

// =============================================================================
// PluginDescriptor
// =============================================================================

/// One plugin as seen by the resolver and the orchestrator.
///
/// `provides`, `consumes` and `setup` are optional so that raw, unvalidated
/// configuration can be represented; the resolver rejects descriptors missing
/// any of them unless `checked` is set.
#[derive(Clone)]
pub struct PluginDescriptor {
    /// Identity of the plugin (its logical name).
    pub package_path: String,
    /// Services the plugin registers.
    pub provides: Option<Vec<String>>,
    /// Services the plugin needs injected.
    pub consumes: Option<Vec<String>>,
    /// The plugin's initialization.
    pub setup: Option<SharedSetup>,
    /// Free-form options passed to the setup.
    pub options: Value,
    /// Optional version metadata.
    pub version: Option<String>,
    /// Set when the descriptor has already been validated.
    pub checked: bool,
}

impl PluginDescriptor {
    /// Creates a descriptor with empty `provides` and `consumes` and no setup.
    pub fn new(package_path: impl Into<String>) -> Self {
        Self {
            package_path: package_path.into(),
            provides: Some(Vec::new()),
            consumes: Some(Vec::new()),
            setup: None,
            options: Value::Object(Map::new()),
            version: None,
            checked: false,
        }
    }

    /// Sets the provided service names.
    pub fn provides<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the consumed service names.
    pub fn consumes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumes = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the setup from a shared handle.
    pub fn setup(mut self, setup: SharedSetup) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Sets the setup from any [`Setup`] implementation.
    pub fn with_setup<S: Setup + 'static>(self, setup: S) -> Self {
        self.setup(std::sync::Arc::new(setup))
    }

    /// Sets the options passed to the setup.
    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Sets the version metadata.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The plugin's logical name.
    pub fn name(&self) -> &str {
        &self.package_path
    }

    /// Declared provides, or an empty slice if undeclared.
    pub fn provided(&self) -> &[String] {
        self.provides.as_deref().unwrap_or_default()
    }

    /// Declared consumes, or an empty slice if undeclared.
    pub fn consumed(&self) -> &[String] {
        self.consumes.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("package_path", &self.package_path)
            .field("provides", &self.provides)
            .field("consumes", &self.consumes)
            .field("setup", &self.setup.is_some())
            .field("version", &self.version)
            .field("checked", &self.checked)
            .finish()
    }
}

// =============================================================================
// PluginEntry
// =============================================================================

/// A plugin as written in configuration.
///
/// A bare string is shorthand for an entry with only `packagePath` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginEntry {
    /// `"calculator"`
    Name(String),
    /// `{ packagePath = "calculator", ... }`
    Spec(PluginSpec),
}

/// The object form of a [`PluginEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    /// Logical name of the plugin in the catalog.
    #[serde(alias = "package_path")]
    pub package_path: String,
    /// Overrides the catalog's provides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provides: Option<Vec<String>>,
    /// Overrides the catalog's consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumes: Option<Vec<String>>,
    /// Overrides the catalog's version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Every other key, passed to the setup as options.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl PluginEntry {
    /// The entry's logical name.
    pub fn package_path(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Spec(spec) => &spec.package_path,
        }
    }

    /// Returns the object form, expanding the string shorthand.
    pub fn to_spec(&self) -> PluginSpec {
        match self {
            Self::Name(name) => PluginSpec {
                package_path: name.clone(),
                provides: None,
                consumes: None,
                version: None,
                options: Map::new(),
            },
            Self::Spec(spec) => spec.clone(),
        }
    }
}

impl From<&str> for PluginEntry {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}
