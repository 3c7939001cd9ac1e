//! Activation pass: setup and init of every app in dependency order.
//!
//! Per app the pass reads the persisted [`SetupRecord`], runs `setup` when
//! the declared version is ahead of the applied one (or the app is pending
//! or broken), records the outcome, and then calls `init`. Hook failures are
//! contained per app and reported in the [`ActivationReport`].

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::app::DiagnosticResult;
use crate::callbacks::{LoggingInstaller, PackageInstaller};
use crate::config::HostConfig;
use crate::error::{ActivationFailure, HookError, HostError, Result};
use crate::registry::{AppEntry, AppRegistry};
use crate::resolver;
use crate::setup::{
    panic_message, InlineSupervisor, SetupHelper, SetupJob, SetupSupervisor, TimeoutSupervisor,
};
use crate::state::{SetupGuard, SetupLocks, SetupRecord, SetupState, StateStore};

/// What happened to one app during a pass.
#[derive(Debug, Clone)]
pub struct AppOutcome {
    /// Setup state after the pass
    pub state: SetupState,
    /// Applied version after the pass
    pub applied_version: u32,
    /// Whether `setup` was invoked
    pub setup_ran: bool,
    /// Whether `init` was invoked
    pub init_ran: bool,
    /// Failure, if any
    pub error: Option<ActivationFailure>,
}

impl AppOutcome {
    fn from_record(record: SetupRecord) -> Self {
        Self {
            state: record.state,
            applied_version: record.applied_version,
            setup_ran: false,
            init_ran: false,
            error: None,
        }
    }

    /// Whether the app activated without any failure.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-app outcomes of one activation pass, in activation order.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
    outcomes: IndexMap<String, AppOutcome>,
}

impl ActivationReport {
    /// Outcome for one app.
    pub fn get(&self, app: &str) -> Option<&AppOutcome> {
        self.outcomes.get(app)
    }

    /// All outcomes in activation order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AppOutcome)> {
        self.outcomes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Apps in the order they were processed.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.outcomes.keys().map(String::as_str)
    }

    /// Apps that recorded a failure.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &ActivationFailure)> {
        self.outcomes
            .iter()
            .filter_map(|(k, v)| v.error.as_ref().map(|e| (k.as_str(), e)))
    }

    /// Whether every app activated cleanly.
    pub fn is_clean(&self) -> bool {
        self.outcomes.values().all(AppOutcome::is_ok)
    }

    /// Number of apps processed.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Check if the report is empty.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn insert(&mut self, app: &str, outcome: AppOutcome) {
        self.outcomes.insert(app.to_string(), outcome);
    }
}

/// Operator-facing health of one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppHealth {
    /// Setup has never run
    NeverSetUp,
    /// Setup is pending
    NeedsSetup,
    /// The last setup failed; `applied_version` is what still works
    Broken { applied_version: u32 },
    /// Set up but turned off; diagnostics are not run
    Disabled,
    /// Set up, but diagnostics report failures
    Failing { failures: Vec<DiagnosticResult> },
    /// Set up and all diagnostics pass
    UpToDate,
}

/// Drives setup and init of registered apps.
///
/// All methods take `&self`; the manager can be shared between the startup
/// pass and admin-triggered re-activation.
pub struct LifecycleManager {
    registry: Arc<AppRegistry>,
    store: Arc<dyn StateStore>,
    installer: Arc<dyn PackageInstaller>,
    supervisor: Arc<dyn SetupSupervisor>,
    locks: Arc<SetupLocks>,
    strict: bool,
}

impl LifecycleManager {
    /// Create a manager with inline setup, a logging installer, and
    /// contained failures.
    pub fn new(registry: Arc<AppRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            installer: Arc::new(LoggingInstaller),
            supervisor: Arc::new(InlineSupervisor),
            locks: Arc::new(SetupLocks::new()),
            strict: false,
        }
    }

    /// Create a manager honoring the strict flag and setup timeout of `config`.
    pub fn from_config(
        registry: Arc<AppRegistry>,
        store: Arc<dyn StateStore>,
        config: &HostConfig,
    ) -> Result<Self> {
        let mut manager = Self::new(registry, store).strict(config.strict);
        if let Some(timeout) = config.setup_timeout {
            manager = manager.with_supervisor(Arc::new(TimeoutSupervisor::new(timeout)?));
        }
        Ok(manager)
    }

    /// Set the package installer handed to setup hooks.
    pub fn with_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Set how setup jobs are executed.
    pub fn with_supervisor(mut self, supervisor: Arc<dyn SetupSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Re-raise hook failures instead of containing them.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The registry being driven.
    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// The state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Current record for an app.
    pub fn state(&self, app: &str) -> Result<SetupRecord> {
        self.registry.get(app)?;
        self.store.get_state(app)
    }

    /// Dependency order of all registered apps.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        resolver::resolve_order(&self.registry)
    }

    /// Run setup where needed and init for every app, in dependency order.
    ///
    /// Resolution errors abort before any hook runs. Hook failures are
    /// recorded in the report; in strict mode the first one is returned as
    /// [`HostError::Hook`] after its state has been persisted.
    pub fn run_activation_pass(&self) -> Result<ActivationReport> {
        let order = self.resolve_order()?;
        tracing::info!(apps = order.len(), "Starting activation pass");

        let mut report = ActivationReport::default();
        let mut unavailable: HashSet<&str> = HashSet::new();

        for name in &order {
            let entry = self.registry.get(name)?;

            if let Some(dep) = entry
                .depends()
                .iter()
                .find(|dep| unavailable.contains(dep.as_str()))
            {
                tracing::warn!(app = %name, dependency = %dep, "Skipping app, dependency unavailable");
                let mut outcome = AppOutcome::from_record(self.stored_record(name));
                outcome.error = Some(ActivationFailure::DependencyFailed(dep.clone()));
                unavailable.insert(name);
                report.insert(name, outcome);
                continue;
            }

            let outcome = self.activate(entry, false);
            if outcome.error.as_ref().is_some_and(ActivationFailure::is_setup_failure) {
                unavailable.insert(name);
            }
            self.raise_if_strict(name, &outcome)?;
            report.insert(name, outcome);
        }

        tracing::info!(
            apps = report.len(),
            failed = report.failed().count(),
            "Activation pass finished"
        );
        Ok(report)
    }

    /// Force setup of one app from its applied version, then init it.
    ///
    /// Waits for any setup of the same app already in flight.
    pub fn reactivate(&self, app: &str) -> Result<AppOutcome> {
        let entry = self.registry.get(app)?;
        let outcome = self.activate(entry, true);
        self.raise_if_strict(app, &outcome)?;
        Ok(outcome)
    }

    /// Call the app's `enable` hook. The app must be up to date.
    pub fn enable(&self, app: &str) -> Result<()> {
        let entry = self.registry.get(app)?;
        let record = self.store.get_state(app)?;
        if record.state != SetupState::UpToDate {
            return Err(HostError::NotReady {
                app: app.to_string(),
                state: record.state,
            });
        }

        call_hook(app, "enable", || entry.app().enable()).map_err(|e| HostError::Hook {
            app: app.to_string(),
            source: ActivationFailure::Enable(e),
        })?;
        tracing::info!(app, "Enabled app");
        Ok(())
    }

    /// Disable every app that depends on `app`, then `app` itself.
    ///
    /// Dependents are disabled in reverse activation order; their failures
    /// are logged and skipped. Returns the apps that were disabled.
    pub fn disable(&self, app: &str) -> Result<Vec<String>> {
        let entry = self.registry.get(app)?;
        let mut disabled = Vec::new();

        for dependent in resolver::dependents_of(&self.registry, app).into_iter().rev() {
            let dep_entry = self.registry.get(&dependent)?;
            match call_hook(&dependent, "disable", || dep_entry.app().disable()) {
                Ok(()) => disabled.push(dependent),
                Err(e) => tracing::warn!(app = %dependent, error = %e, "Failed to disable dependent"),
            }
        }

        call_hook(app, "disable", || entry.app().disable()).map_err(|e| HostError::Hook {
            app: app.to_string(),
            source: ActivationFailure::Disable(e),
        })?;
        disabled.push(app.to_string());

        tracing::info!(app, disabled = ?disabled, "Disabled app");
        Ok(disabled)
    }

    /// Run the app's diagnostics. A panicking `diagnose` yields one failed
    /// result.
    pub fn diagnose(&self, app: &str) -> Result<Vec<DiagnosticResult>> {
        let entry = self.registry.get(app)?;
        let results = panic::catch_unwind(AssertUnwindSafe(|| entry.app().diagnose()))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(app, error = %message, "Diagnostics panicked");
                vec![DiagnosticResult::failed(format!("diagnostics panicked: {message}"))]
            });
        Ok(results)
    }

    /// Health of one app, combining its setup state and diagnostics.
    pub fn health(&self, app: &str) -> Result<AppHealth> {
        let record = self.state(app)?;
        let health = match record.state {
            SetupState::NotInstalled => AppHealth::NeverSetUp,
            SetupState::NeedsSetup => AppHealth::NeedsSetup,
            SetupState::Broken => AppHealth::Broken {
                applied_version: record.applied_version,
            },
            SetupState::UpToDate if !self.is_enabled(app)? => AppHealth::Disabled,
            SetupState::UpToDate => {
                let failures: Vec<_> = self
                    .diagnose(app)?
                    .into_iter()
                    .filter(|result| !result.passed)
                    .collect();
                if failures.is_empty() {
                    AppHealth::UpToDate
                } else {
                    AppHealth::Failing { failures }
                }
            }
        };
        Ok(health)
    }

    /// Whether the app reports itself enabled. A panicking query counts as
    /// disabled.
    pub fn is_enabled(&self, app: &str) -> Result<bool> {
        let entry = self.registry.get(app)?;
        Ok(panic::catch_unwind(AssertUnwindSafe(|| entry.app().is_enabled())).unwrap_or(false))
    }

    fn raise_if_strict(&self, app: &str, outcome: &AppOutcome) -> Result<()> {
        match &outcome.error {
            Some(failure) if self.strict => Err(HostError::Hook {
                app: app.to_string(),
                source: failure.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Bring one app to `UpToDate` if needed, then init it.
    ///
    /// State store errors stay with the app: they are recorded as
    /// [`ActivationFailure::Store`] and `init` is skipped.
    fn activate(&self, entry: &AppEntry, force: bool) -> AppOutcome {
        match self.try_activate(entry, force) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(app = %entry.name(), error = %e, "Failed to persist setup state");
                let mut outcome = AppOutcome::from_record(self.stored_record(entry.name()));
                outcome.error = Some(ActivationFailure::Store(e.to_string()));
                outcome
            }
        }
    }

    /// Last known record, `NotInstalled / 0` if the store cannot be read.
    fn stored_record(&self, app: &str) -> SetupRecord {
        self.store.get_state(app).unwrap_or_else(|e| {
            tracing::warn!(app, error = %e, "Failed to read setup state");
            SetupRecord::default()
        })
    }

    fn try_activate(&self, entry: &AppEntry, force: bool) -> Result<AppOutcome> {
        let name = entry.name();
        let version = entry.version();
        let mut record = self.store.get_state(name)?;

        if force || record.needs_setup(version) {
            let guard = Arc::new(SetupGuard::acquire(&self.locks, name));
            // Another caller may have finished setup while we waited.
            record = self.store.get_state(name)?;
            if force || record.needs_setup(version) {
                if let Err(e) = self.run_setup(entry, record, guard)? {
                    let record = self.store.get_state(name)?;
                    let mut outcome = AppOutcome::from_record(record);
                    outcome.setup_ran = true;
                    outcome.error = Some(ActivationFailure::Setup(e));
                    return Ok(outcome);
                }
                let mut outcome = self.init(entry, self.store.get_state(name)?);
                outcome.setup_ran = true;
                return Ok(outcome);
            }
        }

        if record.state != SetupState::UpToDate {
            // Version 0 with no record: nothing to set up.
            tracing::debug!(app = %name, "No setup required");
            self.store.set_state(name, SetupState::UpToDate, record.applied_version)?;
            record = SetupRecord::new(SetupState::UpToDate, record.applied_version);
        } else if version < record.applied_version {
            tracing::warn!(
                app = %name,
                version,
                applied_version = record.applied_version,
                "Declared version is older than applied version"
            );
        }

        Ok(self.init(entry, record))
    }

    /// Run setup under the app's guard and persist the transition.
    ///
    /// The outer result carries store errors; the inner one the hook's.
    fn run_setup(
        &self,
        entry: &AppEntry,
        record: SetupRecord,
        guard: Arc<SetupGuard>,
    ) -> Result<std::result::Result<(), HookError>> {
        let name = entry.name();
        let version = entry.version();
        let old_version = record.applied_version;

        self.store.set_state(name, SetupState::NeedsSetup, old_version)?;
        tracing::info!(app = %name, old_version, version, "Running setup");

        let helper = SetupHelper::new(name, Arc::clone(&self.installer));
        let job = SetupJob::new(Arc::clone(entry.app()), helper, old_version, Some(guard));

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.supervisor.run(job)))
            .unwrap_or_else(|payload| Err(HookError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(()) => {
                if let Err(e) = self.store.set_state(name, SetupState::UpToDate, version) {
                    // Completion was not recorded; retry setup next pass.
                    if let Err(e) = self.store.set_state(name, SetupState::Broken, old_version) {
                        tracing::warn!(app = %name, error = %e, "Failed to mark app broken");
                    }
                    return Err(e);
                }
                tracing::info!(app = %name, version, "Setup complete");
                Ok(Ok(()))
            }
            Err(e) => {
                self.store.set_state(name, SetupState::Broken, old_version)?;
                tracing::error!(app = %name, error = %e, "Setup failed, app marked broken");
                Ok(Err(e))
            }
        }
    }

    fn init(&self, entry: &AppEntry, record: SetupRecord) -> AppOutcome {
        let name = entry.name();
        let mut outcome = AppOutcome::from_record(record);
        outcome.init_ran = true;

        if let Err(e) = call_hook(name, "init", || entry.app().init()) {
            outcome.error = Some(ActivationFailure::Init(e));
        } else {
            tracing::debug!(app = %name, "Initialized app");
        }
        outcome
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("apps", &self.registry.len())
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

/// Call a hook, turning a panic into [`HookError::Panicked`] and logging
/// any failure.
fn call_hook(
    app: &str,
    hook: &str,
    f: impl FnOnce() -> std::result::Result<(), HookError>,
) -> std::result::Result<(), HookError> {
    let result = panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(HookError::Panicked(panic_message(payload.as_ref()))));

    if let Err(e) = &result {
        tracing::error!(app, hook, error = %e, "App hook failed");
    }
    result
}
