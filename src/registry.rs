//! Registry of app descriptors.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::app::{App, AppInfo};
use crate::catalog::AppCatalog;
use crate::error::{HostError, Result};

/// A registered app: its identity, the metadata captured at registration,
/// and the shared descriptor instance.
#[derive(Clone)]
pub struct AppEntry {
    name: String,
    info: AppInfo,
    app: Arc<dyn App>,
}

impl AppEntry {
    /// The app identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata as captured at registration.
    pub fn info(&self) -> &AppInfo {
        &self.info
    }

    /// Declared setup version.
    pub fn version(&self) -> u32 {
        self.info.version
    }

    /// Declared dependencies.
    pub fn depends(&self) -> &[String] {
        &self.info.depends
    }

    /// Whether the app is essential.
    pub fn is_essential(&self) -> bool {
        self.info.is_essential
    }

    /// The descriptor instance.
    pub fn app(&self) -> &Arc<dyn App> {
        &self.app
    }
}

impl fmt::Debug for AppEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppEntry")
            .field("name", &self.name)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered collection of apps keyed by identity.
///
/// Registrations are final: an identity cannot be registered twice and an
/// entry is never replaced.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: IndexMap<String, AppEntry>,
}

impl AppRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an app under `name`.
    pub fn register(&mut self, name: impl Into<String>, app: impl App) -> Result<&AppEntry> {
        self.register_arc(name, Arc::new(app))
    }

    /// Register an already shared app under `name`.
    pub fn register_arc(&mut self, name: impl Into<String>, app: Arc<dyn App>) -> Result<&AppEntry> {
        let name = name.into();
        if self.apps.contains_key(&name) {
            return Err(HostError::DuplicateApp(name));
        }

        let info = app.info();
        tracing::debug!(
            app = %name,
            version = info.version,
            depends = ?info.depends,
            "Registered app"
        );

        let entry = self
            .apps
            .entry(name.clone())
            .or_insert(AppEntry { name, info, app });
        Ok(&*entry)
    }

    /// Register every enabled name the catalog can build.
    ///
    /// Unknown names and duplicate registrations are logged and skipped.
    /// Returns the identities that were registered.
    pub fn register_enabled<S: AsRef<str>>(&mut self, catalog: &AppCatalog, enabled: &[S]) -> Vec<String> {
        let mut registered = Vec::new();

        for name in enabled {
            let name = name.as_ref();
            let Some(app) = catalog.create(name) else {
                tracing::warn!(app = name, "Enabled app not found in catalog, skipping");
                continue;
            };

            match self.register_arc(name, app) {
                Ok(_) => registered.push(name.to_string()),
                Err(e) => tracing::error!(app = name, error = %e, "Failed to register app"),
            }
        }

        registered
    }

    /// Look up an app.
    pub fn get(&self, name: &str) -> Result<&AppEntry> {
        self.apps
            .get(name)
            .ok_or_else(|| HostError::UnknownApp(name.to_string()))
    }

    /// Check whether an identity is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    /// Position of an app in insertion order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.apps.get_index_of(name)
    }

    /// All apps in insertion order.
    ///
    /// The iterator can be cloned to restart it. It borrows the registry, so
    /// it always reflects the set that existed when it was created.
    pub fn all(&self) -> impl ExactSizeIterator<Item = &AppEntry> + Clone + '_ {
        self.apps.values()
    }

    /// Identities in insertion order.
    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> + Clone + '_ {
        self.apps.keys().map(String::as_str)
    }

    /// Number of registered apps.
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
