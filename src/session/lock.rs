//! Single-instance session lock.
//!
//! One lock file per working directory. The file holds a `LockRecord`; a record
//! whose pid is no longer alive is stale and may be reclaimed by the next caller.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::liveness::{ProcessProbe, default_probe};

/// Lock directory, relative to the working directory.
pub const LOCK_DIR: &str = ".ralph";

/// Lock file name inside `LOCK_DIR`.
pub const LOCK_FILE: &str = "session.lock";

/// Current on-disk record version.
pub const LOCK_VERSION: u32 = 1;

/// Create attempts before giving up on a lock file that keeps changing.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub version: u32,
}

impl LockRecord {
    /// Record for the current process.
    pub fn for_current_process(session_id: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            version: LOCK_VERSION,
        }
    }
}

/// Outcome of `SessionLock::acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    pub acquired: bool,
    pub error: Option<String>,
    pub existing_pid: Option<u32>,
}

impl LockAcquisition {
    fn acquired() -> Self {
        Self {
            acquired: true,
            error: None,
            existing_pid: None,
        }
    }

    fn held_by(pid: u32) -> Self {
        Self {
            acquired: false,
            error: Some(format!("Another ralph session is running (pid {})", pid)),
            existing_pid: Some(pid),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            acquired: false,
            error: Some(error),
            existing_pid: None,
        }
    }
}

/// File-based single-instance guard for one working directory.
pub struct SessionLock {
    path: PathBuf,
    session_id: String,
    probe: Box<dyn ProcessProbe>,
    held: bool,
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .field("held", &self.held)
            .finish_non_exhaustive()
    }
}

impl SessionLock {
    /// Create a lock for `cwd` using the platform liveness probe.
    pub fn new(cwd: impl AsRef<Path>, session_id: impl Into<String>) -> Self {
        Self::with_probe(cwd, session_id, default_probe())
    }

    /// Create a lock with an explicit liveness probe.
    pub fn with_probe(cwd: impl AsRef<Path>, session_id: impl Into<String>, probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            path: Self::lock_path(cwd),
            session_id: session_id.into(),
            probe,
            held: false,
        }
    }

    /// Lock file location for a working directory.
    pub fn lock_path(cwd: impl AsRef<Path>) -> PathBuf {
        cwd.as_ref().join(LOCK_DIR).join(LOCK_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the lock.
    ///
    /// A missing lock file is created exclusively, so of several concurrent
    /// callers exactly one wins. An unreadable or stale record is replaced. A
    /// live holder blocks acquisition unless `force` is set.
    pub fn acquire(&mut self, force: bool) -> LockAcquisition {
        let record = LockRecord::for_current_process(&self.session_id);
        if force {
            let written = replace_lock_record(&self.path, &record);
            return self.settle(written, &record);
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            match create_lock_record(&self.path, &record) {
                Ok(()) => return self.settle(Ok(()), &record),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return self.settle(Err(e), &record),
            }

            match read_lock_record(&self.path) {
                Some(existing) if self.probe.is_alive(existing.pid) => {
                    debug!("Lock {} held by live pid {}", self.path.display(), existing.pid);
                    return LockAcquisition::held_by(existing.pid);
                }
                Some(existing) => {
                    info!(
                        "Reclaiming stale lock {} (pid {} is not running)",
                        self.path.display(),
                        existing.pid
                    );
                    let written = replace_lock_record(&self.path, &record);
                    return self.settle(written, &record);
                }
                // Released between our create and read
                None if !self.path.exists() => continue,
                None => {
                    info!("Replacing unreadable lock {}", self.path.display());
                    let written = replace_lock_record(&self.path, &record);
                    return self.settle(written, &record);
                }
            }
        }
        LockAcquisition::failed(format!("Lock file {} kept changing, giving up", self.path.display()))
    }

    fn settle(&mut self, written: std::io::Result<()>, record: &LockRecord) -> LockAcquisition {
        match written {
            Ok(()) => {
                self.held = true;
                info!("Acquired session lock {} (pid {})", self.path.display(), record.pid);
                LockAcquisition::acquired()
            }
            Err(e) => LockAcquisition::failed(format!("Failed to write lock file {}: {}", self.path.display(), e)),
        }
    }

    /// Drop the lock file. A missing file is not an error; releasing twice is a no-op.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(e) = remove_lock_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        } else {
            info!("Released session lock {}", self.path.display());
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read the lock record at `path`. Missing or malformed files yield `None`.
pub fn read_lock_record(path: &Path) -> Option<LockRecord> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read lock file {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring malformed lock file {}: {}", path.display(), e);
            None
        }
    }
}

/// Remove the lock file, treating absence as success.
pub fn remove_lock_file(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write the full record beside `path`. Readers never see a partial record
/// because it only ever reaches `path` by link or rename.
fn stage_lock_record(path: &Path, record: &LockRecord) -> std::io::Result<PathBuf> {
    static STAGED: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let n = STAGED.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("lock.tmp-{}-{}", record.pid, n));
    let json = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
    fs::write(&tmp, json)?;
    Ok(tmp)
}

/// Publish `record` only if no lock file exists. Fails with `AlreadyExists` otherwise.
fn create_lock_record(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let tmp = stage_lock_record(path, record)?;
    let linked = fs::hard_link(&tmp, path);
    if let Err(e) = fs::remove_file(&tmp) {
        debug!("Failed to remove staged lock {}: {}", tmp.display(), e);
    }
    linked
}

/// Overwrite whatever lock file exists with `record`.
fn replace_lock_record(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let tmp = stage_lock_record(path, record)?;
    fs::rename(&tmp, path)
}
