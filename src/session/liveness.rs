//! Process liveness probing.
//!
//! The lock file records the pid of its holder. A lock is stale once that pid no
//! longer names a live host process. Probing is platform-specific, so it sits
//! behind the `ProcessProbe` trait with one implementation chosen at startup.

/// Answers whether a pid currently names a live process.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Unix probe: signal 0 via `kill(2)`.
///
/// ESRCH means no such process. Any other failure (EPERM for a process owned by
/// another user, for instance) is reported as alive so that concurrency is refused.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

#[cfg(unix)]
impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(pid_i32) = i32::try_from(pid) else {
            return false;
        };
        if pid_i32 <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid_i32), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                log::debug!("Liveness probe for pid {} failed with {}, assuming alive", pid, e);
                true
            }
        }
    }
}

/// Windows probe: ask `tasklist` for the pid.
#[cfg(not(unix))]
#[derive(Debug, Default, Clone, Copy)]
pub struct TasklistProbe;

#[cfg(not(unix))]
impl ProcessProbe for TasklistProbe {
    fn is_alive(&self, pid: u32) -> bool {
        match std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()),
            // Could not ask: refuse concurrency rather than steal a live lock
            Err(_) => true,
        }
    }
}

/// The probe for the current platform.
pub fn default_probe() -> Box<dyn ProcessProbe> {
    #[cfg(unix)]
    {
        Box::new(SignalProbe)
    }
    #[cfg(not(unix))]
    {
        Box::new(TasklistProbe)
    }
}
