//! Error types for app host operations.
//!
//! [`HostError`] is structural and is returned to whoever drives the host.
//! [`ActivationFailure`] describes a single app that failed; it is recorded in
//! the activation report and never aborts the pass outside strict mode.

use std::time::Duration;

use thiserror::Error;

use crate::state::SetupState;

/// Errors that can occur during app host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// App identity already registered
    #[error("App already registered: {0}")]
    DuplicateApp(String),

    /// App identity not registered
    #[error("Unknown app: {0}")]
    UnknownApp(String),

    /// A dependency names an app that was never registered
    #[error("App '{app}' depends on unregistered app '{dependency}'")]
    MissingDependency { app: String, dependency: String },

    /// The dependency graph contains a cycle
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// App is not in a state that allows the requested operation
    #[error("App '{app}' is not ready: {state}")]
    NotReady { app: String, state: SetupState },

    /// A hook failed and was not contained (strict mode or direct call)
    #[error("App '{app}' failed: {source}")]
    Hook {
        app: String,
        #[source]
        source: ActivationFailure,
    },

    /// State store failure not covered by IO or JSON errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// State file could not be parsed or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Atomic replacement of the state file failed
    #[error("Failed to persist state file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Why a single app did not activate cleanly.
#[derive(Debug, Clone, Error)]
pub enum ActivationFailure {
    /// `setup` failed; the app is marked broken and `init` is skipped
    #[error("setup failed: {0}")]
    Setup(#[source] HookError),

    /// `init` failed; the setup state is left as it was
    #[error("init failed: {0}")]
    Init(#[source] HookError),

    /// The setup state could not be read or persisted; `init` is skipped
    #[error("state store failed: {0}")]
    Store(String),

    /// A dependency failed setup earlier in the same pass
    #[error("dependency '{0}' is unavailable")]
    DependencyFailed(String),

    /// `enable` failed
    #[error("enable failed: {0}")]
    Enable(#[source] HookError),

    /// `disable` failed
    #[error("disable failed: {0}")]
    Disable(#[source] HookError),
}

impl ActivationFailure {
    /// Whether this failure leaves the app without a completed setup.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            ActivationFailure::Setup(_)
                | ActivationFailure::Store(_)
                | ActivationFailure::DependencyFailed(_)
        )
    }
}

/// Errors returned by app hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// Generic hook failure
    #[error("{0}")]
    Failed(String),

    /// Package installation failed
    #[error("failed to install {}: {reason}", .packages.join(", "))]
    Install {
        packages: Vec<String>,
        reason: String,
    },

    /// Privileged action failed
    #[error("action '{action}' failed: {reason}")]
    Action { action: String, reason: String },

    /// Hook did not finish in time
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Hook panicked
    #[error("panicked: {0}")]
    Panicked(String),
}

impl HookError {
    /// Create a generic failure from anything printable.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HookError::Failed(message.to_string())
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError::Failed(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError::Failed(message.to_string())
    }
}

/// Result type for app host operations
pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = HostError::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_install_message_lists_packages() {
        let err = HookError::Install {
            packages: vec!["deluged".into(), "deluge-web".into()],
            reason: "apt lock held".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to install deluged, deluge-web: apt lock held"
        );
    }

    #[test]
    fn test_setup_failures_are_classified() {
        assert!(ActivationFailure::Setup(HookError::failed("x")).is_setup_failure());
        assert!(ActivationFailure::DependencyFailed("db".into()).is_setup_failure());
        assert!(ActivationFailure::Store("disk full".into()).is_setup_failure());
        assert!(!ActivationFailure::Init(HookError::failed("x")).is_setup_failure());
    }
}
