//! App descriptors: metadata plus lifecycle hooks.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::HookError;
use crate::setup::SetupHelper;

/// Declared metadata of an app.
///
/// Captured once when the app is registered; later changes to what the
/// descriptor would report are not observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    /// Setup version. Bumping it triggers `setup` on the next activation
    /// pass. 0 means the app has no setup steps.
    pub version: u32,
    /// Identities of apps that must be activated first
    pub depends: Vec<String>,
    /// Essential apps must stay installed and enabled (enforced by the caller)
    pub is_essential: bool,
    /// System packages this app installs
    pub managed_packages: Vec<String>,
    /// System services this app controls
    pub managed_services: Vec<String>,
    /// Short display name
    pub title: String,
    /// Description paragraphs
    pub description: Vec<String>,
}

impl AppInfo {
    /// Create metadata for the given setup version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Add a dependency.
    pub fn depends_on(mut self, app: impl Into<String>) -> Self {
        self.depends.push(app.into());
        self
    }

    /// Mark as essential.
    pub fn essential(mut self, essential: bool) -> Self {
        self.is_essential = essential;
        self
    }

    /// Add managed packages.
    pub fn with_packages(mut self, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.managed_packages
            .extend(packages.into_iter().map(Into::into));
        self
    }

    /// Add managed services.
    pub fn with_services(mut self, services: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.managed_services
            .extend(services.into_iter().map(Into::into));
        self
    }

    /// Set the display title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Add a description paragraph.
    pub fn with_description(mut self, paragraph: impl Into<String>) -> Self {
        self.description.push(paragraph.into());
        self
    }
}

/// Result of one diagnostic check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    /// What was checked
    pub description: String,
    /// Whether the check passed
    pub passed: bool,
}

impl DiagnosticResult {
    /// Create a result from a check outcome.
    pub fn check(description: impl Into<String>, passed: bool) -> Self {
        Self {
            description: description.into(),
            passed,
        }
    }

    /// A passing check.
    pub fn passed(description: impl Into<String>) -> Self {
        Self::check(description, true)
    }

    /// A failing check.
    pub fn failed(description: impl Into<String>) -> Self {
        Self::check(description, false)
    }
}

/// A pluggable feature unit.
///
/// Only [`info`](App::info) is required. Every hook has a default, so an app
/// implements just the ones it needs.
///
/// # Example
///
/// ```rust
/// use lib_app_host::{App, AppInfo, HookError, SetupHelper, SetupPhase};
///
/// struct Deluge;
///
/// impl App for Deluge {
///     fn info(&self) -> AppInfo {
///         AppInfo::new(1)
///             .depends_on("apps")
///             .with_packages(["deluged", "deluge-web"])
///             .with_services(["deluge-web"])
///     }
///
///     fn setup(&self, helper: &mut SetupHelper, _old_version: u32) -> Result<(), HookError> {
///         helper.install(self.info().managed_packages)?;
///         helper.call(SetupPhase::Post, || Ok(()))
///     }
/// }
/// ```
pub trait App: Send + Sync + 'static {
    /// Declared metadata.
    fn info(&self) -> AppInfo;

    /// Register runtime-only concerns. Called on every activation pass after
    /// setup is current; must tolerate repeated calls.
    fn init(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Install or migrate the app from `old_version` to the declared version.
    ///
    /// The default installs the managed packages.
    fn setup(&self, helper: &mut SetupHelper, old_version: u32) -> Result<(), HookError> {
        let _ = old_version;
        let packages = self.info().managed_packages;
        if packages.is_empty() {
            return Ok(());
        }
        helper.install(packages)
    }

    /// Turn the app on.
    fn enable(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Turn the app off.
    fn disable(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Whether the app is currently turned on. Apps without an on/off
    /// switch are always enabled.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Run health checks.
    fn diagnose(&self) -> Vec<DiagnosticResult> {
        Vec::new()
    }
}

/// Runtime-only state owned by an app instance.
///
/// Set from `setup` or `enable`, read from `init`. Lives as long as the
/// descriptor and is never persisted.
#[derive(Debug)]
pub struct RuntimeSlot<T> {
    value: RwLock<Option<T>>,
}

impl<T> RuntimeSlot<T> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, value: T) -> Option<T> {
        self.value.write().replace(value)
    }

    /// Store a value unless one is already present. Returns true if stored.
    pub fn set_if_empty(&self, value: impl FnOnce() -> T) -> bool {
        let mut slot = self.value.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value());
        true
    }

    /// Remove and return the value.
    pub fn take(&self) -> Option<T> {
        self.value.write().take()
    }

    /// Whether a value is present.
    pub fn is_set(&self) -> bool {
        self.value.read().is_some()
    }

    /// Run `f` against the value, if any.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.value.read().as_ref().map(f)
    }
}

impl<T: Clone> RuntimeSlot<T> {
    /// Clone the value out.
    pub fn get(&self) -> Option<T> {
        self.value.read().clone()
    }
}

impl<T> Default for RuntimeSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl App for Minimal {
        fn info(&self) -> AppInfo {
            AppInfo::default()
        }
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let app = Minimal;
        assert!(app.init().is_ok());
        assert!(app.enable().is_ok());
        assert!(app.disable().is_ok());
        assert!(app.is_enabled());
        assert!(app.diagnose().is_empty());
    }

    #[test]
    fn test_info_builder() {
        let info = AppInfo::new(2)
            .depends_on("apps")
            .depends_on("firewall")
            .essential(true)
            .with_packages(["deluged", "deluge-web"])
            .with_services(["deluge-web"])
            .with_title("BitTorrent Web Client")
            .with_description("Deluge is a BitTorrent client that features a Web UI.");

        assert_eq!(info.version, 2);
        assert_eq!(info.depends, vec!["apps", "firewall"]);
        assert!(info.is_essential);
        assert_eq!(info.managed_packages.len(), 2);
        assert_eq!(info.managed_services, vec!["deluge-web"]);
        assert_eq!(info.description.len(), 1);
    }

    #[test]
    fn test_default_version_is_zero() {
        assert_eq!(AppInfo::default().version, 0);
        assert!(!AppInfo::default().is_essential);
    }

    #[test]
    fn test_runtime_slot() {
        let slot: RuntimeSlot<String> = RuntimeSlot::new();
        assert!(!slot.is_set());
        assert!(slot.set_if_empty(|| "deluge-web".to_string()));
        assert!(!slot.set_if_empty(|| "other".to_string()));
        assert_eq!(slot.get().as_deref(), Some("deluge-web"));
        assert_eq!(slot.with(|s| s.len()), Some(10));
        assert_eq!(slot.set("replaced".into()).as_deref(), Some("deluge-web"));
        assert_eq!(slot.take().as_deref(), Some("replaced"));
        assert!(!slot.is_set());
    }

    #[test]
    fn test_diagnostic_constructors() {
        assert!(DiagnosticResult::passed("port 8112 listening").passed);
        assert!(!DiagnosticResult::failed("port 8112 listening").passed);
    }
}
