//! App discovery: the catalog of buildable apps and the enabled list.
//!
//! Apps are compiled into the host and listed in an [`AppCatalog`]. Which of
//! them are active is decided by a modules-enabled directory: every file in
//! it lists module paths, one per line, such as `plinth.modules.deluge`. The
//! last dotted segment is the app identity.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::app::App;
use crate::error::Result;

/// Builds one app instance.
pub type AppFactory = Box<dyn Fn() -> Arc<dyn App> + Send + Sync>;

/// Known apps keyed by identity, in the order they were added.
#[derive(Default)]
pub struct AppCatalog {
    factories: IndexMap<String, AppFactory>,
}

impl AppCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an app factory, replacing any previous factory for `name`.
    pub fn add<A, F>(&mut self, name: impl Into<String>, factory: F)
    where
        A: App,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.factories
            .insert(name.into(), Box::new(move || Arc::new(factory()) as Arc<dyn App>));
    }

    /// Builder form of [`add`](Self::add).
    pub fn with<A, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        A: App,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.add(name, factory);
        self
    }

    /// Build an instance of `name`, if known.
    pub fn create(&self, name: &str) -> Option<Arc<dyn App>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Whether `name` is known.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Known identities in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Number of known apps.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for AppCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCatalog")
            .field("apps", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read the enabled app identities from a modules-enabled directory.
///
/// Files are read in name order, hidden files and subdirectories are
/// skipped, blank lines and `#` comments are ignored. Each identity appears
/// once, at its first occurrence. A missing directory yields no apps.
pub fn read_enabled(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "No modules-enabled directory");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();

    let mut enabled = Vec::new();
    for path in files {
        let content = std::fs::read_to_string(&path)?;
        for line in content.lines() {
            let Some(name) = module_identity(line) else {
                continue;
            };
            if !enabled.iter().any(|existing| existing == name) {
                enabled.push(name.to_string());
            }
        }
    }

    Ok(enabled)
}

/// Identity named by one line of an enabled-list file.
fn module_identity(line: &str) -> Option<&str> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
        return None;
    }
    line.rsplit('.').next().filter(|segment| !segment.is_empty())
}
