//! Session guard module.
//!
//! - SessionLock: one engine per working directory, with stale-lock reclamation
//! - ProcessProbe: per-platform pid liveness check used by the lock

mod liveness;
mod lock;

pub use liveness::{ProcessProbe, default_probe};
pub use lock::{
    LOCK_DIR, LOCK_FILE, LOCK_VERSION, LockAcquisition, LockRecord, SessionLock, read_lock_record, remove_lock_file,
};
