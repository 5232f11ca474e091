//! Pseudo-terminal process bridge.
//!
//! Spawns an interactive child attached to a pty and fans its output out to
//! subscribers. A `ProcessHandle` owns the child for one invocation; `cleanup()`
//! severs delivery, kills the child if still running and releases the pty.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};

use super::decode::Utf8Decoder;
use crate::error::{RalphError, Result};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_TERM: &str = "xterm-256color";

/// How long the exit waiter lets the reader drain after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Options for `ProcessBridge::spawn`.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

impl SpawnOptions {
    /// Environment injected into the child: terminal type and size, then caller
    /// variables. Caller values win on conflict, including `TERM`.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), DEFAULT_TERM.to_string());
        env.insert("COLUMNS".to_string(), self.cols.to_string());
        env.insert("LINES".to_string(), self.rows.to_string());
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

type DataCallback = Box<dyn Fn(&str) + Send + Sync>;
type ExitCallback = Box<dyn Fn(&ProcessExit) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    data: Vec<DataCallback>,
    exit: Vec<ExitCallback>,
    exit_status: Option<ProcessExit>,
    /// Output that arrived before the first data subscriber
    backlog: String,
    closed: bool,
}

struct HandleInner {
    pid: Option<u32>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    subscribers: Mutex<Subscribers>,
    cleaned: AtomicBool,
}

impl HandleInner {
    // Callbacks run with the subscriber lock held, so cleanup() cannot return
    // while a delivery is in flight.
    fn deliver_data(&self, data: &str) {
        if data.is_empty() {
            return;
        }
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        if subs.closed {
            return;
        }
        if subs.data.is_empty() {
            subs.backlog.push_str(data);
            return;
        }
        for callback in &subs.data {
            callback(data);
        }
    }

    fn deliver_exit(&self, exit: ProcessExit) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        if subs.closed || subs.exit_status.is_some() {
            return;
        }
        for callback in &subs.exit {
            callback(&exit);
        }
        subs.exit_status = Some(exit);
    }
}

/// Handle to one pty-attached child process.
///
/// Cheap to clone; all clones share the same child.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("cleaned", &self.is_cleaned())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn is_cleaned(&self) -> bool {
        self.inner.cleaned.load(Ordering::Acquire)
    }

    /// Exit status, once the child has exited.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.inner.subscribers.lock().ok().and_then(|s| s.exit_status.clone())
    }

    /// Subscribe to output. Chunks arrive in order with no line framing.
    /// The first subscriber also receives anything printed before it attached.
    ///
    /// Callbacks must not call back into this handle.
    pub fn on_data(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut subs) = self.inner.subscribers.lock()
            && !subs.closed
        {
            let backlog = std::mem::take(&mut subs.backlog);
            if !backlog.is_empty() {
                callback(&backlog);
            }
            subs.data.push(Box::new(callback));
        }
    }

    /// Subscribe to exit. Fires once; a subscriber registered after the exit is
    /// called immediately.
    pub fn on_exit(&self, callback: impl Fn(&ProcessExit) + Send + Sync + 'static) {
        let Ok(mut subs) = self.inner.subscribers.lock() else {
            return;
        };
        if subs.closed {
            return;
        }
        match &subs.exit_status {
            Some(exit) => callback(exit),
            None => subs.exit.push(Box::new(callback)),
        }
    }

    /// Write bytes to the child. Silently dropped after cleanup.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_cleaned() {
            return Ok(());
        }
        let mut writer = self
            .inner
            .writer
            .lock()
            .map_err(|_| RalphError::Process("pty writer lock poisoned".to_string()))?;
        if let Some(writer) = writer.as_mut() {
            writer.write_all(data)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Resize the pty. No-op once the pty is gone.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.is_cleaned() {
            return Ok(());
        }
        let master = self
            .inner
            .master
            .lock()
            .map_err(|_| RalphError::Process("pty master lock poisoned".to_string()))?;
        if let Some(master) = master.as_ref() {
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| RalphError::Process(format!("Failed to resize pty: {}", e)))?;
        }
        Ok(())
    }

    /// Stop all delivery, kill a still-running child and release the pty.
    /// Safe to call any number of times.
    pub fn cleanup(&self) {
        if self.inner.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }

        let still_running = match self.inner.subscribers.lock() {
            Ok(mut subs) => {
                subs.closed = true;
                subs.data.clear();
                subs.exit.clear();
                subs.backlog.clear();
                subs.exit_status.is_none()
            }
            Err(_) => true,
        };

        if let Ok(mut writer) = self.inner.writer.lock() {
            writer.take();
        }
        if still_running
            && let Ok(mut killer) = self.inner.killer.lock()
            && let Some(killer) = killer.as_mut()
            && let Err(e) = killer.kill()
        {
            debug!("Kill during cleanup failed (child may have exited): {}", e);
        }
        if let Ok(mut killer) = self.inner.killer.lock() {
            killer.take();
        }
        if let Ok(mut master) = self.inner.master.lock() {
            master.take();
        }
        debug!("Cleaned up process handle (pid {:?})", self.inner.pid);
    }
}

/// Spawns pty-attached children.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBridge;

impl ProcessBridge {
    /// Spawn `program args...` on a fresh pty sized `cols`×`rows`.
    pub fn spawn(program: &str, args: &[String], options: SpawnOptions) -> Result<ProcessHandle> {
        let size = PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| RalphError::Process(format!("Failed to open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Some(cwd) = options.cwd.as_ref() {
            cmd.cwd(cwd);
        }
        for (key, value) in options.environment() {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RalphError::Process(format!("Failed to spawn {}: {}", program, e)))?;
        // Our copy of the slave must go, or the reader never sees EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RalphError::Process(format!("Failed to clone pty reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RalphError::Process(format!("Failed to take pty writer: {}", e)))?;

        let pid = child.process_id();
        let killer = child.clone_killer();
        let inner = Arc::new(HandleInner {
            pid,
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            killer: Mutex::new(Some(killer)),
            subscribers: Mutex::new(Subscribers::default()),
            cleaned: AtomicBool::new(false),
        });

        let (drained_tx, drained_rx) = mpsc::channel::<()>();
        spawn_reader(inner.clone(), reader, drained_tx);

        let waiter_inner = inner.clone();
        thread::spawn(move || {
            let exit = match child.wait() {
                Ok(status) => ProcessExit {
                    exit_code: Some(status.exit_code() as i32),
                    signal: status.signal().map(str::to_string),
                },
                Err(e) => {
                    warn!("Failed to wait for pty child: {}", e);
                    ProcessExit {
                        exit_code: None,
                        signal: None,
                    }
                }
            };
            // Let trailing output reach subscribers before the exit notification
            let _ = drained_rx.recv_timeout(READER_DRAIN_TIMEOUT);
            waiter_inner.deliver_exit(exit);
        });

        debug!("Spawned {} on pty {}x{} (pid {:?})", program, options.cols, options.rows, pid);
        Ok(ProcessHandle { inner })
    }
}

fn spawn_reader(inner: Arc<HandleInner>, mut reader: Box<dyn Read + Send>, drained: mpsc::Sender<()>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut decoder = Utf8Decoder::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&buf[..n]);
                    inner.deliver_data(&text);
                }
                Err(e) => {
                    // Linux reports EIO once the slave side is gone
                    debug!("pty read ended: {}", e);
                    break;
                }
            }
        }
        inner.deliver_data(&decoder.finish());
        let _ = drained.send(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults() {
        let env = SpawnOptions::default().environment();
        assert_eq!(env.get("TERM").map(String::as_str), Some(DEFAULT_TERM));
        assert_eq!(env.get("COLUMNS").map(String::as_str), Some("80"));
        assert_eq!(env.get("LINES").map(String::as_str), Some("24"));
    }

    #[test]
    fn test_environment_caller_wins() {
        let mut options = SpawnOptions {
            cols: 120,
            rows: 40,
            ..Default::default()
        };
        options.env.insert("TERM".to_string(), "dumb".to_string());
        options.env.insert("FOO".to_string(), "bar".to_string());

        let env = options.environment();
        assert_eq!(env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(env.get("COLUMNS").map(String::as_str), Some("120"));
        assert_eq!(env.get("LINES").map(String::as_str), Some("40"));
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_process_exit_success() {
        assert!(ProcessExit::code(0).success());
        assert!(!ProcessExit::code(1).success());
        let signalled = ProcessExit {
            exit_code: Some(0),
            signal: Some("Killed".to_string()),
        };
        assert!(!signalled.success());
    }
}
