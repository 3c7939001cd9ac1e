//! Persisted setup state per app.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{HostError, Result};

/// Setup state of one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupState {
    /// Setup has never run
    #[default]
    NotInstalled,
    /// Setup must run before the app can initialize
    NeedsSetup,
    /// Setup completed for the recorded version
    UpToDate,
    /// The last setup attempt failed
    Broken,
}

impl SetupState {
    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupState::NotInstalled => "not-installed",
            SetupState::NeedsSetup => "needs-setup",
            SetupState::UpToDate => "up-to-date",
            SetupState::Broken => "broken",
        }
    }
}

impl fmt::Display for SetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus the version for which setup last completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetupRecord {
    /// Current state
    pub state: SetupState,
    /// Version whose setup last succeeded (0 if never)
    pub applied_version: u32,
}

impl SetupRecord {
    /// Create a record.
    pub fn new(state: SetupState, applied_version: u32) -> Self {
        Self {
            state,
            applied_version,
        }
    }

    /// Whether setup must run for a descriptor declaring `version`.
    ///
    /// Broken apps retry on every pass. A `NotInstalled` app at version 0 has
    /// nothing to set up.
    pub fn needs_setup(&self, version: u32) -> bool {
        version > self.applied_version
            || matches!(self.state, SetupState::NeedsSetup | SetupState::Broken)
    }
}

/// Persistence for setup records.
///
/// Implementations must make `set_state` atomic: a concurrent reader sees
/// either the old pair or the new pair, never a mix.
pub trait StateStore: Send + Sync {
    /// Get the record for an app, `NotInstalled`/0 when never recorded.
    fn get_state(&self, app: &str) -> Result<SetupRecord>;

    /// Record a new state and applied version.
    fn set_state(&self, app: &str, state: SetupState, applied_version: u32) -> Result<()>;

    /// All recorded apps, ordered by identity.
    fn records(&self) -> Result<Vec<(String, SetupRecord)>>;
}

/// In-memory store, for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<String, SetupRecord>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record.
    pub fn with_record(self, app: impl Into<String>, state: SetupState, applied_version: u32) -> Self {
        self.records
            .write()
            .insert(app.into(), SetupRecord::new(state, applied_version));
        self
    }
}

impl StateStore for MemoryStateStore {
    fn get_state(&self, app: &str) -> Result<SetupRecord> {
        Ok(self.records.read().get(app).copied().unwrap_or_default())
    }

    fn set_state(&self, app: &str, state: SetupState, applied_version: u32) -> Result<()> {
        self.records
            .write()
            .insert(app.to_string(), SetupRecord::new(state, applied_version));
        Ok(())
    }

    fn records(&self) -> Result<Vec<(String, SetupRecord)>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

const STATE_FILE_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    format: u32,
    #[serde(default)]
    apps: BTreeMap<String, SetupRecord>,
}

/// JSON file store.
///
/// The whole document is cached in memory and rewritten through a temp file
/// plus rename on every update.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, SetupRecord>>,
}

impl FileStateStore {
    /// Open a store, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: StateFile = serde_json::from_str(&content)?;
            if file.format != STATE_FILE_FORMAT {
                return Err(HostError::StateStore(format!(
                    "Unsupported state file format {} in {:?}",
                    file.format, path
                )));
            }
            file.apps
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), apps = records.len(), "Opened setup state file");

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, records: &BTreeMap<String, SetupRecord>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let file = StateFile {
            format: STATE_FILE_FORMAT,
            apps: records.clone(),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get_state(&self, app: &str) -> Result<SetupRecord> {
        Ok(self.records.read().get(app).copied().unwrap_or_default())
    }

    fn set_state(&self, app: &str, state: SetupState, applied_version: u32) -> Result<()> {
        let mut records = self.records.write();
        let previous = records.insert(app.to_string(), SetupRecord::new(state, applied_version));

        if let Err(e) = self.write_file(&records) {
            // Keep memory and disk in agreement.
            match previous {
                Some(record) => records.insert(app.to_string(), record),
                None => records.remove(app),
            };
            return Err(e);
        }
        Ok(())
    }

    fn records(&self) -> Result<Vec<(String, SetupRecord)>> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}

/// Per-app mutual exclusion for setup.
///
/// Tracks the identities whose setup is in flight; acquiring an identity that
/// is already taken blocks until its guard is dropped.
#[derive(Debug, Default)]
pub struct SetupLocks {
    running: Mutex<HashSet<String>>,
    released: Condvar,
}

impl SetupLocks {
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether setup for `app` is currently in flight.
    pub fn is_held(&self, app: &str) -> bool {
        self.running.lock().contains(app)
    }
}

/// Held while one app's setup runs. Releases the identity on drop.
#[derive(Debug)]
pub struct SetupGuard {
    locks: Arc<SetupLocks>,
    app: String,
}

impl SetupGuard {
    /// Block until no other setup for `app` is in flight, then take it.
    pub fn acquire(locks: &Arc<SetupLocks>, app: &str) -> Self {
        let mut running = locks.running.lock();
        while running.contains(app) {
            tracing::debug!(app, "Waiting for in-flight setup");
            locks.released.wait(&mut running);
        }
        running.insert(app.to_string());

        Self {
            locks: Arc::clone(locks),
            app: app.to_string(),
        }
    }

    /// The app this guard holds.
    pub fn app(&self) -> &str {
        &self.app
    }
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        let mut running = self.locks.running.lock();
        running.remove(&self.app);
        self.locks.released.notify_all();
    }
}
