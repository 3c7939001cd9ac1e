//! Main app host: discovery, registration and startup.

use std::sync::Arc;

use crate::app::App;
use crate::callbacks::{LoggingInstaller, PackageInstaller};
use crate::catalog::{self, AppCatalog};
use crate::config::HostConfig;
use crate::error::Result;
use crate::lifecycle::{ActivationReport, LifecycleManager};
use crate::registry::{AppEntry, AppRegistry};
use crate::state::{FileStateStore, StateStore};

/// Collects apps during startup and hands them to a [`LifecycleManager`].
///
/// Registration needs `&mut self`; once [`start`](Self::start) or
/// [`into_lifecycle`](Self::into_lifecycle) is called the registry is frozen
/// and shared.
pub struct AppHost {
    config: HostConfig,
    registry: AppRegistry,
    store: Arc<dyn StateStore>,
    installer: Arc<dyn PackageInstaller>,
}

impl AppHost {
    /// Create a host with a file-backed state store and a logging installer.
    pub fn new(config: HostConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let store = Arc::new(FileStateStore::open(&config.state_file)?);
        Ok(Self::with_store(config, store, Arc::new(LoggingInstaller)))
    }

    /// Create a host with a custom state store and installer.
    pub fn with_store(
        config: HostConfig,
        store: Arc<dyn StateStore>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            config,
            registry: AppRegistry::new(),
            store,
            installer,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Get the registry.
    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// Get the state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Register an app directly.
    pub fn register(&mut self, name: impl Into<String>, app: impl App) -> Result<&AppEntry> {
        self.registry.register(name, app)
    }

    // === Discovery ===

    /// Register every app listed in the modules-enabled directory that the
    /// catalog knows. Returns the identities registered.
    pub fn scan_enabled(&mut self, catalog: &AppCatalog) -> Result<Vec<String>> {
        let enabled = catalog::read_enabled(&self.config.modules_enabled_dir)?;
        let registered = self.registry.register_enabled(catalog, &enabled);

        tracing::info!(
            enabled = enabled.len(),
            registered = registered.len(),
            dir = %self.config.modules_enabled_dir.display(),
            "Scanned enabled apps"
        );
        Ok(registered)
    }

    // === Startup ===

    /// Freeze the registry and build the lifecycle manager.
    pub fn into_lifecycle(self) -> Result<LifecycleManager> {
        let manager = LifecycleManager::from_config(Arc::new(self.registry), self.store, &self.config)?;
        Ok(manager.with_installer(self.installer))
    }

    /// Freeze the registry and run the first activation pass.
    pub fn start(self) -> Result<(LifecycleManager, ActivationReport)> {
        let manager = self.into_lifecycle()?;
        let report = manager.run_activation_pass()?;
        Ok((manager, report))
    }
}

impl std::fmt::Debug for AppHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHost")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppInfo;
    use crate::state::SetupState;

    struct Stub(u32, &'static [&'static str]);

    impl App for Stub {
        fn info(&self) -> AppInfo {
            self.1
                .iter()
                .fold(AppInfo::new(self.0), |info, dep| info.depends_on(*dep))
        }
    }

    fn config(dir: &std::path::Path) -> HostConfig {
        HostConfig::new(dir.join("state").join("setup.json"), dir.join("enabled"))
    }

    #[test]
    fn test_scan_enabled_registers_catalog_apps() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(&config.modules_enabled_dir).unwrap();
        std::fs::write(
            config.modules_enabled_dir.join("plinth"),
            "plinth.modules.apps\nplinth.modules.deluge\nplinth.modules.ghost\n",
        )
        .unwrap();

        let catalog = AppCatalog::new()
            .with("apps", || Stub(1, &[]))
            .with("deluge", || Stub(2, &["apps"]));

        let mut host = AppHost::new(config).unwrap();
        let registered = host.scan_enabled(&catalog).unwrap();

        assert_eq!(registered, vec!["apps", "deluge"]);
        assert_eq!(host.registry().len(), 2);
    }

    #[test]
    fn test_start_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = config(dir.path()).state_file;

        let mut host = AppHost::new(config(dir.path())).unwrap();
        host.register("apps", Stub(1, &[])).unwrap();
        host.register("deluge", Stub(2, &["apps"])).unwrap();

        let (manager, report) = host.start().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.order().collect::<Vec<_>>(), vec!["apps", "deluge"]);
        assert_eq!(manager.state("deluge").unwrap().applied_version, 2);

        let reopened = FileStateStore::open(&state_file).unwrap();
        let record = reopened.get_state("deluge").unwrap();
        assert_eq!(record.state, SetupState::UpToDate);
        assert_eq!(record.applied_version, 2);
    }
}
