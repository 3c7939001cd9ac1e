//! Setup helper passed to app `setup` hooks, and supervision of setup runs.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::app::App;
use crate::callbacks::PackageInstaller;
use crate::error::HookError;
use crate::state::SetupGuard;

/// Named phases of a setup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupPhase {
    /// Before packages are installed
    Pre,
    /// Package installation
    Install,
    /// After `setup` has returned successfully
    Post,
}

type DeferredCall = Box<dyn FnOnce() -> Result<(), HookError> + Send>;

/// Handed to [`App::setup`] to request package installs and schedule calls.
pub struct SetupHelper {
    app: String,
    installer: Arc<dyn PackageInstaller>,
    phase: SetupPhase,
    installed: Vec<String>,
    deferred: Vec<DeferredCall>,
}

impl SetupHelper {
    /// Create a helper for `app`.
    pub fn new(app: impl Into<String>, installer: Arc<dyn PackageInstaller>) -> Self {
        Self {
            app: app.into(),
            installer,
            phase: SetupPhase::Pre,
            installed: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// The app being set up.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// The phase the run is currently in.
    pub fn phase(&self) -> SetupPhase {
        self.phase
    }

    /// Packages installed so far in this run.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    /// Number of calls waiting for the post phase.
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    /// Install packages through the host's installer.
    pub fn install(
        &mut self,
        packages: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), HookError> {
        let packages: Vec<String> = packages.into_iter().map(Into::into).collect();
        if packages.is_empty() {
            return Ok(());
        }

        self.phase = SetupPhase::Install;
        tracing::debug!(app = %self.app, packages = ?packages, "Installing packages");
        self.installer.install(&self.app, &packages)?;
        self.installed.extend(packages);
        Ok(())
    }

    /// Run `f` in `phase`.
    ///
    /// `Pre` and `Install` calls run immediately. `Post` calls are queued and
    /// run in order once `setup` has returned successfully; a failing post
    /// call fails the whole setup.
    pub fn call<F>(&mut self, phase: SetupPhase, f: F) -> Result<(), HookError>
    where
        F: FnOnce() -> Result<(), HookError> + Send + 'static,
    {
        match phase {
            SetupPhase::Post => {
                self.deferred.push(Box::new(f));
                Ok(())
            }
            SetupPhase::Pre | SetupPhase::Install => {
                self.phase = phase;
                f()
            }
        }
    }

    /// Run queued post calls.
    pub(crate) fn finish(&mut self) -> Result<(), HookError> {
        self.phase = SetupPhase::Post;
        for call in self.deferred.drain(..) {
            call()?;
        }
        Ok(())
    }
}

impl fmt::Debug for SetupHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupHelper")
            .field("app", &self.app)
            .field("phase", &self.phase)
            .field("installed", &self.installed)
            .field("pending", &self.deferred.len())
            .finish()
    }
}

/// One pending setup invocation.
///
/// Owns everything the run needs, so a supervisor can move it to another
/// thread. Holds a share of the app's setup guard until it is dropped.
pub struct SetupJob {
    app: Arc<dyn App>,
    helper: SetupHelper,
    old_version: u32,
    _guard: Option<Arc<SetupGuard>>,
}

impl SetupJob {
    pub(crate) fn new(
        app: Arc<dyn App>,
        helper: SetupHelper,
        old_version: u32,
        guard: Option<Arc<SetupGuard>>,
    ) -> Self {
        Self {
            app,
            helper,
            old_version,
            _guard: guard,
        }
    }

    /// Identity of the app being set up.
    pub fn app_name(&self) -> &str {
        self.helper.app()
    }

    /// Version setup is migrating from.
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    /// Run `setup` and then the queued post calls. Panics become
    /// [`HookError::Panicked`].
    pub fn run(self) -> Result<(), HookError> {
        let SetupJob {
            app,
            mut helper,
            old_version,
            _guard,
        } = self;

        panic::catch_unwind(AssertUnwindSafe(move || {
            app.setup(&mut helper, old_version)?;
            helper.finish()
        }))
        .unwrap_or_else(|payload| Err(HookError::Panicked(panic_message(payload.as_ref()))))
    }
}

impl fmt::Debug for SetupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupJob")
            .field("helper", &self.helper)
            .field("old_version", &self.old_version)
            .finish_non_exhaustive()
    }
}

/// Decides how a setup job is executed.
pub trait SetupSupervisor: Send + Sync {
    /// Execute `job` to completion or failure.
    fn run(&self, job: SetupJob) -> Result<(), HookError>;
}

/// Runs setup on the calling thread with no time limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineSupervisor;

impl SetupSupervisor for InlineSupervisor {
    fn run(&self, job: SetupJob) -> Result<(), HookError> {
        job.run()
    }
}

/// Runs each setup on a blocking worker and gives up after a timeout.
///
/// The worker cannot be cancelled; a timed-out job keeps running in the
/// background and keeps its app's setup guard until it returns.
///
/// When called from inside a tokio runtime the job runs on a plain thread
/// instead, and the calling thread blocks until it finishes or times out.
pub struct TimeoutSupervisor {
    timeout: Duration,
    runtime: Option<tokio::runtime::Runtime>,
}

impl TimeoutSupervisor {
    /// Create a supervisor with its own runtime.
    pub fn new(timeout: Duration) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .thread_name("app-setup")
            .build()?;

        Ok(Self {
            timeout,
            runtime: Some(runtime),
        })
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl SetupSupervisor for TimeoutSupervisor {
    fn run(&self, job: SetupJob) -> Result<(), HookError> {
        let timeout = self.timeout;
        let runtime = match self.runtime.as_ref() {
            Some(runtime) if tokio::runtime::Handle::try_current().is_err() => runtime,
            _ => return run_on_thread(job, timeout),
        };

        let app = job.app_name().to_string();

        runtime.block_on(async move {
            let worker = tokio::task::spawn_blocking(move || job.run());
            match tokio::time::timeout(timeout, worker).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(HookError::Panicked(e.to_string())),
                Err(_) => {
                    tracing::warn!(app = %app, ?timeout, "Setup timed out");
                    Err(HookError::TimedOut(timeout))
                }
            }
        })
    }
}

/// Run `job` on a dedicated thread and wait at most `timeout` for it.
fn run_on_thread(job: SetupJob, timeout: Duration) -> Result<(), HookError> {
    let app = job.app_name().to_string();
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("app-setup".into())
        .spawn(move || {
            let _ = tx.send(job.run());
        })
        .map_err(HookError::failed)?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(app = %app, ?timeout, "Setup timed out");
            Err(HookError::TimedOut(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(HookError::Panicked("setup worker exited without a result".into()))
        }
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        // Do not wait for timed-out workers.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TimeoutSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutSupervisor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppInfo;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingInstaller {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl PackageInstaller for RecordingInstaller {
        fn install(&self, app: &str, packages: &[String]) -> Result<(), HookError> {
            self.calls.lock().push((app.to_string(), packages.to_vec()));
            if self.fail {
                return Err(HookError::Install {
                    packages: packages.to_vec(),
                    reason: "mirror unreachable".into(),
                });
            }
            Ok(())
        }
    }

    struct PackagesOnly;

    impl App for PackagesOnly {
        fn info(&self) -> AppInfo {
            AppInfo::new(1).with_packages(["deluged", "deluge-web"])
        }
    }

    struct Sleepy(Duration);

    impl App for Sleepy {
        fn info(&self) -> AppInfo {
            AppInfo::new(1)
        }

        fn setup(&self, _helper: &mut SetupHelper, _old_version: u32) -> Result<(), HookError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    struct Panics;

    impl App for Panics {
        fn info(&self) -> AppInfo {
            AppInfo::new(1)
        }

        fn setup(&self, _helper: &mut SetupHelper, _old_version: u32) -> Result<(), HookError> {
            panic!("setup exploded");
        }
    }

    fn helper(installer: Arc<RecordingInstaller>) -> SetupHelper {
        SetupHelper::new("deluge", installer)
    }

    #[test]
    fn test_install_delegates_to_installer() {
        let installer = Arc::new(RecordingInstaller::default());
        let mut helper = helper(installer.clone());

        helper.install(["deluged", "deluge-web"]).unwrap();

        assert_eq!(helper.phase(), SetupPhase::Install);
        assert_eq!(helper.installed(), ["deluged", "deluge-web"]);
        let calls = installer.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "deluge");
    }

    #[test]
    fn test_install_nothing_skips_installer() {
        let installer = Arc::new(RecordingInstaller::default());
        let mut helper = helper(installer.clone());

        helper.install(Vec::<String>::new()).unwrap();

        assert!(installer.calls.lock().is_empty());
        assert_eq!(helper.phase(), SetupPhase::Pre);
    }

    #[test]
    fn test_install_failure_propagates() {
        let installer = Arc::new(RecordingInstaller {
            fail: true,
            ..Default::default()
        });
        let mut helper = helper(installer);

        let err = helper.install(["deluged"]).unwrap_err();
        assert!(matches!(err, HookError::Install { .. }));
        assert!(helper.installed().is_empty());
    }

    #[test]
    fn test_post_calls_are_deferred() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut helper = helper(Arc::new(RecordingInstaller::default()));

        let o = order.clone();
        helper
            .call(SetupPhase::Post, move || {
                o.lock().push("post");
                Ok(())
            })
            .unwrap();
        let o = order.clone();
        helper
            .call(SetupPhase::Pre, move || {
                o.lock().push("pre");
                Ok(())
            })
            .unwrap();

        assert_eq!(*order.lock(), vec!["pre"]);
        assert_eq!(helper.pending(), 1);

        helper.finish().unwrap();

        assert_eq!(*order.lock(), vec!["pre", "post"]);
        assert_eq!(helper.pending(), 0);
        assert_eq!(helper.phase(), SetupPhase::Post);
    }

    #[test]
    fn test_failing_post_call_stops_the_rest() {
        let ran = Arc::new(Mutex::new(0));
        let mut helper = helper(Arc::new(RecordingInstaller::default()));

        helper
            .call(SetupPhase::Post, || Err(HookError::failed("service refused to start")))
            .unwrap();
        let r = ran.clone();
        helper
            .call(SetupPhase::Post, move || {
                *r.lock() += 1;
                Ok(())
            })
            .unwrap();

        assert!(helper.finish().is_err());
        assert_eq!(*ran.lock(), 0);
    }

    #[test]
    fn test_default_setup_installs_managed_packages() {
        let installer = Arc::new(RecordingInstaller::default());
        let job = SetupJob::new(Arc::new(PackagesOnly), helper(installer.clone()), 0, None);

        InlineSupervisor.run(job).unwrap();

        assert_eq!(installer.calls.lock()[0].1, vec!["deluged", "deluge-web"]);
    }

    #[test]
    fn test_panicking_setup_is_contained() {
        let job = SetupJob::new(
            Arc::new(Panics),
            helper(Arc::new(RecordingInstaller::default())),
            0,
            None,
        );

        match InlineSupervisor.run(job) {
            Err(HookError::Panicked(message)) => assert_eq!(message, "setup exploded"),
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_supervisor_times_out() {
        let supervisor = TimeoutSupervisor::new(Duration::from_millis(20)).unwrap();
        let job = SetupJob::new(
            Arc::new(Sleepy(Duration::from_millis(500))),
            helper(Arc::new(RecordingInstaller::default())),
            0,
            None,
        );

        assert_eq!(
            supervisor.run(job),
            Err(HookError::TimedOut(Duration::from_millis(20)))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_supervisor_inside_runtime() {
        let supervisor = TimeoutSupervisor::new(Duration::from_secs(5)).unwrap();
        let job = SetupJob::new(
            Arc::new(Sleepy(Duration::from_millis(1))),
            helper(Arc::new(RecordingInstaller::default())),
            0,
            None,
        );
        assert_eq!(supervisor.run(job), Ok(()));

        let supervisor = TimeoutSupervisor::new(Duration::from_millis(20)).unwrap();
        let job = SetupJob::new(
            Arc::new(Sleepy(Duration::from_millis(500))),
            helper(Arc::new(RecordingInstaller::default())),
            0,
            None,
        );
        assert_eq!(
            supervisor.run(job),
            Err(HookError::TimedOut(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_timeout_supervisor_passes_fast_setup() {
        let supervisor = TimeoutSupervisor::new(Duration::from_secs(5)).unwrap();
        let job = SetupJob::new(
            Arc::new(Sleepy(Duration::from_millis(1))),
            helper(Arc::new(RecordingInstaller::default())),
            3,
            None,
        );

        assert_eq!(job.old_version(), 3);
        assert_eq!(supervisor.run(job), Ok(()));
    }
}
