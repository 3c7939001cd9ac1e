//! Host collaborators that app hooks call through.
//!
//! The host does not install packages or run privileged actions itself; it
//! hands these traits to the apps and observes the results.

use crate::error::HookError;

/// Installs system packages on behalf of an app's setup.
pub trait PackageInstaller: Send + Sync {
    /// Install `packages` for `app`. Must return only once the packages are
    /// installed or the attempt has failed.
    fn install(&self, app: &str, packages: &[String]) -> Result<(), HookError>;
}

/// Runs privileged host actions (service control, config rewrites).
pub trait ActionRunner: Send + Sync {
    /// Run `action` with `args`, returning its output.
    fn run(&self, action: &str, args: &[String]) -> Result<String, HookError>;
}

/// Installer that only logs what it was asked to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInstaller;

impl PackageInstaller for LoggingInstaller {
    fn install(&self, app: &str, packages: &[String]) -> Result<(), HookError> {
        tracing::info!(app, packages = ?packages, "Package install requested");
        Ok(())
    }
}

/// Action runner that logs and succeeds without touching the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunActions;

impl ActionRunner for DryRunActions {
    fn run(&self, action: &str, args: &[String]) -> Result<String, HookError> {
        tracing::info!(action, args = ?args, "Dry run of privileged action");
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_installer_succeeds() {
        let installer = LoggingInstaller;
        assert!(installer.install("deluge", &["deluged".into()]).is_ok());
    }

    #[test]
    fn test_dry_run_returns_empty_output() {
        let runner = DryRunActions;
        assert_eq!(runner.run("deluge", &["enable".into()]).unwrap(), "");
    }
}
