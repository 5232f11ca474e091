//! Agents run as plain piped child processes.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::definition::{AgentDefinition, PromptDelivery, builtin_agents};
use super::launcher::{AgentEvent, AgentExecution, AgentLauncher, ExecutionControl, LaunchRequest};
use crate::error::{RalphError, Result};
use crate::events::OutputStream;
use crate::process::{ProcessExit, Utf8Decoder};

/// How long to let the output readers drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Launches agents with separate stdout/stderr pipes.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    agents: HashMap<String, AgentDefinition>,
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new(builtin_agents())
    }
}

impl CommandLauncher {
    pub fn new(agents: HashMap<String, AgentDefinition>) -> Self {
        Self { agents }
    }

    pub fn definition(&self, agent_id: &str) -> Result<&AgentDefinition> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| RalphError::Agent(format!("Unknown agent: {}", agent_id)))
    }
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<AgentExecution> {
        let def = self.definition(&request.agent_id)?;
        let args = def.build_args(&request.prompt, request.model.as_deref(), request.attach_url.as_deref());

        let mut cmd = Command::new(&def.command);
        cmd.args(&args)
            .envs(&def.env)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RalphError::Agent(format!("Failed to spawn {}: {}", def.command, e)))?;
        let pid = child.id();
        debug!("Launched {} (pid {:?})", request.agent_id, pid);

        let mut stdin = child.stdin.take();
        if def.prompt == PromptDelivery::Stdin
            && let Some(mut input) = stdin.take()
        {
            input.write_all(request.prompt.as_bytes()).await?;
            input.write_all(b"\n").await?;
            // Dropping closes stdin so the agent sees EOF
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, tx.clone()));
        }

        let kill = CancellationToken::new();
        let waiter_kill = kill.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => exit_from_status(status),
                    Err(e) => {
                        warn!("Failed to wait for agent: {}", e);
                        ProcessExit { exit_code: None, signal: None }
                    }
                },
                _ = waiter_kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!("Kill failed (agent may have exited): {}", e);
                    }
                    return;
                }
            };
            for reader in readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }
            let _ = tx.send(AgentEvent::Exit(exit));
        });

        let control = CommandControl {
            pid,
            stdin: Mutex::new(stdin),
            kill,
            cleaned: AtomicBool::new(false),
        };
        Ok(AgentExecution::new(rx, Box::new(control)))
    }
}

fn spawn_reader<R>(mut source: R, stream: OutputStream, tx: mpsc::UnboundedSender<AgentEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut decoder = Utf8Decoder::new();
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = decoder.push(&buf[..n]);
                    if !data.is_empty() && tx.send(AgentEvent::Output { stream, data }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Agent {:?} read ended: {}", stream, e);
                    break;
                }
            }
        }
        let data = decoder.finish();
        if !data.is_empty() {
            let _ = tx.send(AgentEvent::Output { stream, data });
        }
    })
}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    ProcessExit {
        exit_code: status.code(),
        signal: signal_name(&status),
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    status
        .signal()
        .map(|sig| Signal::try_from(sig).map(|s| s.as_str().to_string()).unwrap_or_else(|_| sig.to_string()))
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

struct CommandControl {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    kill: CancellationToken,
    cleaned: AtomicBool,
}

#[async_trait]
impl ExecutionControl for CommandControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.cleaned.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(input) => {
                input.write_all(data).await?;
                input.flush().await?;
            }
            None => debug!("Agent stdin closed, dropping {} bytes", data.len()),
        }
        Ok(())
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.kill.cancel();
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
        debug!("Cleaned up agent (pid {:?})", self.pid);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh_launcher(script: &str) -> CommandLauncher {
        let def = AgentDefinition::new("/bin/sh").with_args(["-c", script, "sh"]);
        CommandLauncher::new(HashMap::from([("sh".to_string(), def)]))
    }

    fn request(dir: &TempDir) -> LaunchRequest {
        LaunchRequest {
            agent_id: "sh".to_string(),
            prompt: "the prompt".to_string(),
            cwd: dir.path().to_path_buf(),
            model: None,
            attach_url: None,
        }
    }

    async fn collect(execution: &mut AgentExecution) -> (String, String, ProcessExit) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(event) = execution.events.recv().await {
            match event {
                AgentEvent::Output {
                    stream: OutputStream::Stderr,
                    data,
                } => stderr.push_str(&data),
                AgentEvent::Output { data, .. } => stdout.push_str(&data),
                AgentEvent::Exit(exit) => return (stdout, stderr, exit),
            }
        }
        panic!("channel closed without exit");
    }

    #[tokio::test]
    async fn test_streams_and_exit_code() {
        let dir = TempDir::new().unwrap();
        // With `sh -c script sh prompt`, the prompt arrives as $1
        let launcher = sh_launcher("echo \"out:$1\"; echo err >&2; exit 3");
        let mut execution = launcher.launch(&request(&dir)).await.unwrap();

        let (stdout, stderr, exit) = collect(&mut execution).await;
        assert_eq!(stdout, "out:the prompt\n");
        assert_eq!(stderr, "err\n");
        assert_eq!(exit.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_write_reaches_stdin() {
        let dir = TempDir::new().unwrap();
        let launcher = sh_launcher("read line; echo \"got:$line\"");
        let mut execution = launcher.launch(&request(&dir)).await.unwrap();

        execution.control.write(b"steer me\n").await.unwrap();
        let (stdout, _, exit) = collect(&mut execution).await;
        assert_eq!(stdout, "got:steer me\n");
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_drops_writes() {
        let dir = TempDir::new().unwrap();
        let launcher = sh_launcher("sleep 30");
        let execution = launcher.launch(&request(&dir)).await.unwrap();
        assert!(execution.control.pid().is_some());

        execution.control.cleanup();
        execution.control.cleanup();
        execution.control.write(b"ignored\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let dir = TempDir::new().unwrap();
        let launcher = CommandLauncher::new(HashMap::new());
        let err = launcher.launch(&request(&dir)).await.err().unwrap();
        assert!(matches!(err, RalphError::Agent(_)));
    }
}
