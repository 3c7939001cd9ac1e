//! App host configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the app host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// File holding the persisted setup records
    pub state_file: PathBuf,

    /// Directory listing the enabled apps
    pub modules_enabled_dir: PathBuf,

    /// Re-raise hook failures instead of containing them
    pub strict: bool,

    /// Upper bound on a single setup run (None = no limit)
    pub setup_timeout: Option<Duration>,
}

impl HostConfig {
    /// Create a new configuration with required paths.
    pub fn new(state_file: PathBuf, modules_enabled_dir: PathBuf) -> Self {
        Self {
            state_file,
            modules_enabled_dir,
            strict: false,
            setup_timeout: None,
        }
    }

    /// Enable strict mode.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bound every setup run by `timeout`.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = Some(timeout);
        self
    }

    /// Ensure the state file's directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            state_file: data_dir.join("app-host").join("setup-state.json"),
            modules_enabled_dir: config_dir.join("app-host").join("modules-enabled"),
            strict: false,
            setup_timeout: None,
        }
    }
}
