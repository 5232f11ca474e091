//! The loop engine.
//!
//! Each iteration selects a task, launches the active agent with a rendered
//! prompt and supervises it until exit. A clean exit completes the task; a
//! rate-limit signature backs off (optionally switching to a fallback agent) and
//! retries the same task; any other failure is an error. Teardown always runs.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::control::{ControlCommand, EngineHandle};
use super::state::{EngineState, LoopStatus};
use crate::agent::{AgentEvent, AgentExecution, AgentLauncher, LaunchRequest, LineBuffer, parse_stream_line};
use crate::error::{RalphError, Result};
use crate::events::{AdapterMode, HeadlessEvent, HeadlessPipeline, IterationOutcome, OutputStream};
use crate::id::{generate_session_id, now_ms};
use crate::process::ProcessExit;
use crate::prompt::{PromptContext, PromptRenderer};
use crate::ratelimit::{
    AgentReason, BackoffPolicy, DetectionInput, FallbackResolver, RateLimitDetector, RateLimitVerdict,
};
use crate::remote::{DEFAULT_HEALTH_TIMEOUT, RemoteSession, connect_to_external_server};
use crate::repo::{GitObserver, RepoChanges, RepoObserver};
use crate::session::{ProcessProbe, SessionLock};
use crate::tasks::{Task, TaskSource};

/// Stderr / terminal output kept for rate-limit detection.
const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// Explicit engine configuration. Nothing is read from ambient state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Working directory: lock scope, agent cwd and repository root
    pub cwd: PathBuf,
    pub primary_agent: String,
    pub model: Option<String>,
    pub sandbox: Option<String>,
    /// Remote agent server to attach to
    pub server_url: Option<String>,
    pub health_timeout: Duration,
    pub max_iterations: Option<u32>,
    /// Skip a failing task instead of halting
    pub continue_on_error: bool,
    /// Quiet period after which the agent is reported idle
    pub idle_timeout: Option<Duration>,
    pub restore_primary_on_success: bool,
    pub force_lock: bool,
    pub backoff: BackoffPolicy,
}

impl EngineConfig {
    pub fn new(cwd: impl Into<PathBuf>, primary_agent: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            primary_agent: primary_agent.into(),
            model: None,
            sandbox: None,
            server_url: None,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            max_iterations: None,
            continue_on_error: false,
            idle_timeout: None,
            restore_primary_on_success: false,
            force_lock: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How an agent invocation ended.
enum Supervision {
    Exited { exit: ProcessExit, diagnostics: Diagnostics },
    LaunchFailed(String),
    Interrupted,
}

/// Drives an agent through a task plan.
pub struct LoopEngine {
    config: EngineConfig,
    session_id: String,
    launcher: Arc<dyn AgentLauncher>,
    tasks: Box<dyn TaskSource>,
    repo: Arc<dyn RepoObserver>,
    renderer: PromptRenderer,
    detector: RateLimitDetector,
    fallback: FallbackResolver,
    pipeline: HeadlessPipeline,
    state: EngineState,
    lock: SessionLock,
    remote: Option<RemoteSession>,
    handle: EngineHandle,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    cancel: CancellationToken,
    status_tx: watch::Sender<LoopStatus>,
    /// Tasks that failed under `continue_on_error`
    skipped: HashSet<String>,
    /// Task to run again after a rate limit
    retry: Option<Task>,
}

impl LoopEngine {
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn AgentLauncher>,
        tasks: Box<dyn TaskSource>,
        pipeline: HeadlessPipeline,
    ) -> Self {
        let session_id = generate_session_id();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(LoopStatus::Starting);
        let handle = EngineHandle::new(commands_tx, cancel.clone(), status_rx);

        let lock = SessionLock::new(&config.cwd, &session_id);
        let repo: Arc<dyn RepoObserver> = Arc::new(GitObserver::new(&config.cwd));
        let state = EngineState::new(&config.primary_agent, now_ms());

        Self {
            config,
            session_id,
            launcher,
            tasks,
            repo,
            renderer: PromptRenderer::default(),
            detector: RateLimitDetector::new(),
            fallback: FallbackResolver::default(),
            pipeline,
            state,
            lock,
            remote: None,
            handle,
            commands,
            cancel,
            status_tx,
            skipped: HashSet::new(),
            retry: None,
        }
    }

    pub fn with_repo_observer(mut self, repo: Arc<dyn RepoObserver>) -> Self {
        self.repo = repo;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackResolver) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_renderer(mut self, renderer: PromptRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_lock_probe(mut self, probe: Box<dyn ProcessProbe>) -> Self {
        self.lock = SessionLock::with_probe(&self.config.cwd, &self.session_id, probe);
        self
    }

    /// Control handle; clone freely.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status()
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.state.status());
    }

    fn emit(&mut self, event: HeadlessEvent) {
        self.pipeline.emit(event);
    }

    /// Run until the plan is complete, the engine is stopped, or an error halts it.
    ///
    /// Fails only on lock contention; every other failure ends in `LoopStatus::Error`
    /// with an `error` event.
    pub async fn run(&mut self) -> Result<LoopStatus> {
        let acquisition = self.lock.acquire(self.config.force_lock);
        if !acquisition.acquired {
            self.pipeline.finalize();
            return Err(match acquisition.existing_pid {
                Some(pid) => RalphError::LockContention { pid },
                None => RalphError::Lock(acquisition.error.unwrap_or_else(|| "lock not acquired".to_string())),
            });
        }
        info!("Session {} started in {:?}", self.session_id, self.config.cwd);

        if let Err(e) = self.run_locked().await {
            error!("Engine failed: {}", e);
            self.emit(HeadlessEvent::error(e.to_string(), true));
            self.state.fail();
        }

        self.teardown();
        Ok(self.state.status())
    }

    async fn run_locked(&mut self) -> Result<()> {
        self.emit(HeadlessEvent::Session {
            session_id: self.session_id.clone(),
            pid: std::process::id(),
            cwd: self.config.cwd.display().to_string(),
        });
        self.state.mark_ready()?;
        self.publish();

        if !self.attach_remote().await {
            return Ok(());
        }
        if let Some(mode) = self.config.sandbox.clone() {
            self.emit(HeadlessEvent::Sandbox { mode });
        }
        if let Some(model) = self.config.model.clone() {
            self.emit(HeadlessEvent::Model { model });
        }
        self.emit(HeadlessEvent::ActiveAgent {
            agent_id: self.state.agent().agent_id().to_string(),
            reason: self.state.agent().reason(),
        });

        let (complete, total) = self.tasks.counts();
        self.state.set_task_counts(complete, total);

        loop {
            self.drain_commands();
            if self.cancel.is_cancelled() {
                self.state.stop();
            }
            if self.state.is_terminal() {
                break;
            }
            if self.state.raw_status() == LoopStatus::Pausing {
                self.wait_while_paused().await?;
                continue;
            }
            if let Some(max) = self.config.max_iterations
                && self.state.iteration_count() >= max
            {
                info!("Reached iteration limit ({})", max);
                self.state.stop();
                break;
            }
            if self.tasks.refresh()? {
                let path = self.tasks.path().map(|p| p.display().to_string()).unwrap_or_default();
                self.emit(HeadlessEvent::PlanModified { path });
                self.retry = None;
            }

            self.state.begin_selecting()?;
            self.publish();

            let next = match self.retry.take() {
                Some(task) => Some(task),
                None => self.tasks.next_task(&self.skipped),
            };
            let (complete, total) = self.tasks.counts();
            self.state.set_task_counts(complete, total);

            let Some(task) = next else {
                info!("No actionable tasks left ({}/{} complete)", complete, total);
                self.emit(HeadlessEvent::Complete {
                    iterations: self.state.stats().iterations,
                    tasks_complete: complete,
                    total_tasks: total,
                });
                self.state.complete()?;
                break;
            };

            self.emit(HeadlessEvent::Progress {
                task_id: task.id.clone(),
                tasks_complete: complete,
                total_tasks: total,
                eta_ms: self.state.eta_ms(total.saturating_sub(complete)),
            });
            self.ensure_remote().await?;
            self.run_iteration(task).await?;
        }
        Ok(())
    }

    /// Best-effort teardown; every step runs regardless of the others.
    fn teardown(&mut self) {
        self.cancel.cancel();
        if !self.state.is_terminal() {
            self.state.stop();
        }
        if let Some(remote) = self.remote.as_mut() {
            remote.close();
        }
        self.lock.release();
        self.pipeline.finalize();
        self.publish();
        info!("Session {} ended: {}", self.session_id, self.state.status());
    }

    async fn attach_remote(&mut self) -> bool {
        let Some(url) = self.config.server_url.clone() else {
            self.emit(HeadlessEvent::AdapterMode {
                mode: AdapterMode::Local,
                url: None,
            });
            return true;
        };

        match connect_to_external_server(&url, self.config.health_timeout).await {
            Ok(remote) => {
                self.emit(HeadlessEvent::AdapterMode {
                    mode: AdapterMode::Remote,
                    url: Some(remote.url().to_string()),
                });
                self.remote = Some(remote);
                true
            }
            Err(e) => {
                error!("Remote attach failed: {}", e);
                self.emit(HeadlessEvent::error(e.to_string(), true));
                self.state.fail();
                self.publish();
                false
            }
        }
    }

    /// Re-attach to the remote server if it stopped answering.
    async fn ensure_remote(&mut self) -> Result<()> {
        let Some(remote) = self.remote.as_mut() else {
            return Ok(());
        };
        if remote.health().await.is_ok() {
            return Ok(());
        }
        warn!("Remote server {} unhealthy, reconnecting", remote.url());
        remote.reconnect().await
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ControlCommand::Pause => {
                    self.state.request_pause();
                }
                ControlCommand::Resume => {
                    self.state.resume();
                }
                ControlCommand::Stop => {
                    self.state.stop();
                }
                ControlCommand::Steer(message) => {
                    warn!("No agent running, dropping steering message: {}", message);
                }
            }
            self.publish();
        }
    }

    async fn wait_while_paused(&mut self) -> Result<()> {
        self.state.enter_paused()?;
        self.emit(HeadlessEvent::Pause);
        self.publish();
        info!("Paused");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state.stop();
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(ControlCommand::Resume) => {
                        if self.state.resume() {
                            self.emit(HeadlessEvent::Resume);
                            info!("Resumed");
                        }
                        break;
                    }
                    Some(ControlCommand::Stop) | None => {
                        self.state.stop();
                        break;
                    }
                    Some(ControlCommand::Pause) => {}
                    Some(ControlCommand::Steer(message)) => {
                        warn!("Paused, dropping steering message: {}", message);
                    }
                },
            }
        }
        self.publish();
        Ok(())
    }

    async fn run_iteration(&mut self, task: Task) -> Result<()> {
        let agent_id = self.state.agent().agent_id().to_string();
        let index = self.state.begin_iteration(&task.id)?;
        self.publish();
        self.emit(HeadlessEvent::IterationStart {
            iteration: index,
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            agent_id: agent_id.clone(),
        });

        let prompt = self
            .renderer
            .render(&PromptContext::new(&task, index, self.tasks.path()))?;
        self.emit(HeadlessEvent::Prompt {
            task_id: task.id.clone(),
            prompt: prompt.clone(),
        });

        let snapshot = self.repo.snapshot().await;
        let request = LaunchRequest {
            agent_id: agent_id.clone(),
            prompt,
            cwd: self.config.cwd.clone(),
            model: self.config.model.clone(),
            attach_url: self.remote.as_ref().map(|r| r.url().to_string()),
        };

        let supervision = match self.launcher.launch(&request).await {
            Ok(mut execution) => {
                let supervision = self.supervise(&mut execution).await;
                execution.control.cleanup();
                supervision
            }
            Err(e) => Supervision::LaunchFailed(e.to_string()),
        };
        let changes = self.repo.changes_since(&snapshot).await;

        match supervision {
            Supervision::Interrupted => self.finish_interrupted(index, &task, changes),
            Supervision::LaunchFailed(message) => self.finish_failed(index, &task, changes, message),
            Supervision::Exited { exit, .. } if exit.success() => self.finish_completed(index, &task, changes),
            Supervision::Exited { exit, diagnostics } => {
                let input = DetectionInput::from_exit(&diagnostics.stderr, &exit).with_agent(&agent_id);
                let verdict = self.detector.detect(&input);
                if verdict.is_rate_limit {
                    self.finish_rate_limited(index, task, changes, &agent_id, verdict).await
                } else {
                    let message = failure_message(&agent_id, &exit, diagnostics.summary());
                    self.finish_failed(index, &task, changes, message)
                }
            }
        }
    }

    async fn supervise(&mut self, execution: &mut AgentExecution) -> Supervision {
        let mut lines = LineBuffer::new();
        let mut diagnostics = Diagnostics::default();
        let mut last_output = Instant::now();

        loop {
            let idle_at = match self.config.idle_timeout {
                Some(timeout) if !self.state.is_idle() => Some(last_output + timeout),
                _ => None,
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state.stop();
                    return Supervision::Interrupted;
                }
                command = self.commands.recv() => {
                    if let Some(command) = command
                        && self.apply_during_execution(command, execution).await
                    {
                        return Supervision::Interrupted;
                    }
                }
                event = execution.events.recv() => match event {
                    Some(AgentEvent::Output { stream, data }) => {
                        last_output = Instant::now();
                        if self.state.set_idle(false) {
                            self.emit(HeadlessEvent::Idle { idle: false });
                            self.publish();
                        }
                        self.handle_output(stream, data, &mut lines, &mut diagnostics);
                    }
                    Some(AgentEvent::Exit(exit)) => {
                        self.flush_lines(&mut lines);
                        debug!("Agent exited: {:?}", exit);
                        return Supervision::Exited { exit, diagnostics };
                    }
                    None => {
                        warn!("Agent event stream closed without an exit status");
                        self.flush_lines(&mut lines);
                        let exit = ProcessExit { exit_code: None, signal: None };
                        return Supervision::Exited { exit, diagnostics };
                    }
                },
                _ = idle_deadline(idle_at) => {
                    if self.state.set_idle(true) {
                        info!("Agent idle");
                        self.emit(HeadlessEvent::Idle { idle: true });
                        self.publish();
                    }
                }
            }
        }
    }

    /// Apply a control command while an agent runs. Returns true on stop.
    async fn apply_during_execution(&mut self, command: ControlCommand, execution: &AgentExecution) -> bool {
        match command {
            ControlCommand::Steer(message) => {
                info!("Steering agent");
                let mut data = message.into_bytes();
                data.push(b'\n');
                if let Err(e) = execution.control.write(&data).await {
                    warn!("Failed to steer agent: {}", e);
                }
                false
            }
            ControlCommand::Pause => {
                if self.state.request_pause() {
                    self.publish();
                }
                false
            }
            ControlCommand::Resume => {
                self.state.resume();
                self.publish();
                false
            }
            ControlCommand::Stop => {
                self.state.stop();
                self.publish();
                true
            }
        }
    }

    fn handle_output(&mut self, stream: OutputStream, data: String, lines: &mut LineBuffer, diagnostics: &mut Diagnostics) {
        match stream {
            OutputStream::Stdout => {
                for line in lines.push(&data) {
                    for event in parse_stream_line(&line) {
                        self.emit(event);
                    }
                }
            }
            OutputStream::Stderr | OutputStream::Terminal => {
                diagnostics.push(stream, &data);
                self.emit(HeadlessEvent::output(stream, data));
            }
        }
    }

    fn flush_lines(&mut self, lines: &mut LineBuffer) {
        if let Some(line) = lines.flush() {
            for event in parse_stream_line(&line) {
                self.emit(event);
            }
        }
    }

    /// Seal the running iteration. Returns its duration in ms.
    fn seal(&mut self, outcome: IterationOutcome, changes: RepoChanges) -> Result<u64> {
        let record = self.state.end_iteration(outcome, changes)?;
        Ok(record.duration().map(|d| d.as_millis() as u64).unwrap_or(0))
    }

    fn emit_iteration_end(&mut self, index: u32, task: &Task, changes: RepoChanges, duration_ms: u64, outcome: IterationOutcome) {
        self.pipeline.emit_stats(self.state.stats());
        self.emit(HeadlessEvent::IterationEnd {
            iteration: index,
            task_id: task.id.clone(),
            duration_ms,
            commits: changes.commits,
            outcome,
        });
    }

    fn finish_completed(&mut self, index: u32, task: &Task, changes: RepoChanges) -> Result<()> {
        // The agent may have edited the plan; mark against what is on disk now
        if self.tasks.refresh()? {
            let path = self.tasks.path().map(|p| p.display().to_string()).unwrap_or_default();
            self.emit(HeadlessEvent::PlanModified { path });
        }
        self.tasks.complete_task(&task.id)?;
        let (complete, total) = self.tasks.counts();
        self.state.set_task_counts(complete, total);

        let duration_ms = self.seal(IterationOutcome::Completed, changes)?;
        self.emit_iteration_end(index, task, changes, duration_ms, IterationOutcome::Completed);
        info!("Iteration {} completed {} in {}ms", index, task.id, duration_ms);

        if let Some(attempt) = self.state.clear_backoff() {
            self.emit(HeadlessEvent::BackoffCleared { attempt });
        }
        if self.config.restore_primary_on_success && self.state.restore_primary() {
            info!("Restored primary agent {}", self.state.agent().primary());
            self.emit(HeadlessEvent::ActiveAgent {
                agent_id: self.state.agent().agent_id().to_string(),
                reason: AgentReason::Primary,
            });
        }
        self.publish();
        Ok(())
    }

    fn finish_failed(&mut self, index: u32, task: &Task, changes: RepoChanges, message: String) -> Result<()> {
        let duration_ms = self.seal(IterationOutcome::Failed, changes)?;
        self.emit_iteration_end(index, task, changes, duration_ms, IterationOutcome::Failed);

        let fatal = !self.config.continue_on_error;
        error!("Iteration {} failed: {}", index, message);
        self.emit(HeadlessEvent::error(message, fatal));
        if fatal {
            self.state.fail();
        } else {
            warn!("Skipping {} and continuing", task.id);
            self.skipped.insert(task.id.clone());
        }
        self.publish();
        Ok(())
    }

    fn finish_interrupted(&mut self, index: u32, task: &Task, changes: RepoChanges) -> Result<()> {
        let duration_ms = self.seal(IterationOutcome::Interrupted, changes)?;
        self.emit_iteration_end(index, task, changes, duration_ms, IterationOutcome::Interrupted);
        self.retry = None;
        self.publish();
        Ok(())
    }

    async fn finish_rate_limited(
        &mut self,
        index: u32,
        task: Task,
        changes: RepoChanges,
        agent_id: &str,
        verdict: RateLimitVerdict,
    ) -> Result<()> {
        warn!("Agent {} rate limited: {:?}", agent_id, verdict.message);
        self.emit(HeadlessEvent::RateLimit {
            agent_id: agent_id.to_string(),
            message: verdict.message.clone(),
            retry_after_secs: verdict.retry_after_seconds,
        });

        let duration_ms = self.seal(IterationOutcome::RateLimited, changes)?;
        self.emit_iteration_end(index, &task, changes, duration_ms, IterationOutcome::RateLimited);

        let retry_after = verdict.retry_after_seconds.map(Duration::from_secs);
        let delay = self.state.record_rate_limit(&self.config.backoff, retry_after);

        if let Some(fallback) = self.fallback.get_fallback_agent(agent_id)
            && self.state.switch_agent(&fallback)
        {
            info!("Switching from {} to fallback agent {}", agent_id, fallback);
            self.emit(HeadlessEvent::ActiveAgent {
                agent_id: fallback,
                reason: AgentReason::Fallback,
            });
        }

        self.emit(HeadlessEvent::Backoff {
            attempt: self.state.backoff().attempt(),
            delay_ms: delay.as_millis() as u64,
            retry_after_secs: verdict.retry_after_seconds,
            agent_id: self.state.agent().agent_id().to_string(),
        });
        self.retry = Some(task);
        self.publish();

        self.wait_backoff(delay).await;
        Ok(())
    }

    /// Sleep out a backoff. Stop cancels it; pause takes effect once it ends.
    async fn wait_backoff(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state.stop();
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(ControlCommand::Stop) | None => {
                        self.state.stop();
                        break;
                    }
                    Some(ControlCommand::Pause) => {
                        self.state.request_pause();
                    }
                    Some(ControlCommand::Resume) => {
                        self.state.resume();
                    }
                    Some(ControlCommand::Steer(message)) => {
                        warn!("Backing off, dropping steering message: {}", message);
                    }
                },
                _ = sleep_until(deadline) => break,
            }
            self.publish();
        }
        self.state.finish_backoff();
        self.publish();
    }
}

async fn idle_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Bounded tails of what an agent wrote outside structured stdout.
#[derive(Debug, Default)]
struct Diagnostics {
    /// The only text rate-limit detection sees.
    stderr: String,
    /// PTY transcript. Mixes stdout in, so it only describes failures.
    terminal: String,
}

impl Diagnostics {
    fn push(&mut self, stream: OutputStream, data: &str) {
        match stream {
            OutputStream::Stderr => push_bounded(&mut self.stderr, data),
            OutputStream::Terminal => push_bounded(&mut self.terminal, data),
            OutputStream::Stdout => {}
        }
    }

    fn summary(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.terminal
        } else {
            &self.stderr
        }
    }
}

/// Append to `buffer`, keeping only the last `MAX_DIAGNOSTIC_BYTES`.
fn push_bounded(buffer: &mut String, data: &str) {
    buffer.push_str(data);
    if buffer.len() > MAX_DIAGNOSTIC_BYTES {
        let mut cut = buffer.len() - MAX_DIAGNOSTIC_BYTES;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

fn failure_message(agent_id: &str, exit: &ProcessExit, diagnostics: &str) -> String {
    let how = match (exit.exit_code, exit.signal.as_deref()) {
        (_, Some(signal)) => format!("signal {}", signal),
        (Some(code), None) => format!("exit code {}", code),
        (None, None) => "unknown status".to_string(),
    };
    match diagnostics.lines().rev().map(str::trim).find(|line| !line.is_empty()) {
        Some(line) => format!("Agent {} failed with {}: {}", agent_id, how, line),
        None => format!("Agent {} failed with {}", agent_id, how),
    }
}
