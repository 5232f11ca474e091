//! Engine state: loop status, iteration history and run aggregates.
//!
//! All mutation goes through named transition methods; invalid transitions are
//! rejected with `RalphError::InvalidState`.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};
use crate::events::{IterationOutcome, StatsSnapshot};
use crate::ratelimit::{ActiveAgentState, BackoffPolicy, BackoffState};
use crate::repo::RepoChanges;

/// Externally visible engine status. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Starting,
    Ready,
    /// Between iterations: bookkeeping or backoff wait
    Running,
    Selecting,
    Executing,
    /// Pause requested, takes effect at the next iteration boundary
    Pausing,
    Paused,
    Stopped,
    Complete,
    /// Executing, but the agent has gone quiet
    Idle,
    Error,
}

impl LoopStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopStatus::Stopped | LoopStatus::Complete | LoopStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Starting => "starting",
            LoopStatus::Ready => "ready",
            LoopStatus::Running => "running",
            LoopStatus::Selecting => "selecting",
            LoopStatus::Executing => "executing",
            LoopStatus::Pausing => "pausing",
            LoopStatus::Paused => "paused",
            LoopStatus::Stopped => "stopped",
            LoopStatus::Complete => "complete",
            LoopStatus::Idle => "idle",
            LoopStatus::Error => "error",
        }
    }

    fn can_transition_to(self, next: LoopStatus) -> bool {
        use LoopStatus::*;
        match (self, next) {
            (from, Stopped | Error) => !from.is_terminal(),
            (Starting, Ready) => true,
            (Ready | Running, Selecting) => true,
            (Selecting, Executing | Complete) => true,
            (Executing, Running) => true,
            (Ready | Selecting | Running | Executing, Pausing) => true,
            (Pausing, Paused | Running | Selecting | Executing) => true,
            (Paused, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent invocation. Sealed at iteration end and immutable afterwards.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    index: u32,
    task_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    ended_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    commits: u32,
    outcome: Option<IterationOutcome>,
}

impl IterationRecord {
    fn begin(index: u32, task_id: &str) -> Self {
        Self {
            index,
            task_id: task_id.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            ended_at: None,
            duration: None,
            commits: 0,
            outcome: None,
        }
    }

    fn seal(&mut self, outcome: IterationOutcome, commits: u32) {
        if self.is_sealed() {
            return;
        }
        self.ended_at = Some(Utc::now());
        self.duration = Some(self.started.elapsed());
        self.commits = commits;
        self.outcome = Some(outcome);
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn commits(&self) -> u32 {
        self.commits
    }

    pub fn outcome(&self) -> Option<IterationOutcome> {
        self.outcome
    }

    pub fn is_sealed(&self) -> bool {
        self.duration.is_some()
    }
}

/// Everything the engine mutates while running.
#[derive(Debug)]
pub struct EngineState {
    status: LoopStatus,
    /// Status to return to if a pending pause is withdrawn
    paused_from: LoopStatus,
    idle: bool,
    stats: StatsSnapshot,
    backoff: BackoffState,
    agent: ActiveAgentState,
    iterations: Vec<IterationRecord>,
}

impl EngineState {
    pub fn new(primary_agent: impl Into<String>, start_time: u64) -> Self {
        Self {
            status: LoopStatus::Starting,
            paused_from: LoopStatus::Starting,
            idle: false,
            stats: StatsSnapshot::new(start_time),
            backoff: BackoffState::new(),
            agent: ActiveAgentState::new(primary_agent),
            iterations: Vec::new(),
        }
    }

    /// Status as reported to observers; `Idle` while executing with the idle flag set.
    pub fn status(&self) -> LoopStatus {
        if self.status == LoopStatus::Executing && self.idle {
            LoopStatus::Idle
        } else {
            self.status
        }
    }

    /// Status ignoring the idle flag.
    pub fn raw_status(&self) -> LoopStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }

    pub fn agent(&self) -> &ActiveAgentState {
        &self.agent
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn iterations(&self) -> &[IterationRecord] {
        &self.iterations
    }

    pub fn iteration_count(&self) -> u32 {
        self.iterations.len() as u32
    }

    fn transition(&mut self, next: LoopStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RalphError::InvalidState(format!("Cannot go from {} to {}", self.status, next)));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(LoopStatus::Ready)
    }

    pub fn begin_selecting(&mut self) -> Result<()> {
        self.transition(LoopStatus::Selecting)
    }

    /// Start a new iteration for `task_id`. Returns its 1-based index.
    pub fn begin_iteration(&mut self, task_id: &str) -> Result<u32> {
        self.transition(LoopStatus::Executing)?;
        self.idle = false;
        let index = self.iteration_count() + 1;
        self.iterations.push(IterationRecord::begin(index, task_id));
        Ok(index)
    }

    /// Seal the current iteration and fold its repository changes into the stats.
    ///
    /// A pending pause survives; otherwise the engine is back to `Running`.
    pub fn end_iteration(&mut self, outcome: IterationOutcome, changes: RepoChanges) -> Result<&IterationRecord> {
        self.idle = false;
        match self.status {
            LoopStatus::Executing => self.transition(LoopStatus::Running)?,
            LoopStatus::Pausing => self.paused_from = LoopStatus::Running,
            // Stopped mid-iteration: still seal the record
            status if status.is_terminal() => {}
            status => {
                return Err(RalphError::InvalidState(format!("No iteration running (status {})", status)));
            }
        }

        self.stats.iterations += 1;
        self.stats.commits += changes.commits;
        self.stats.lines_added += changes.lines_added;
        self.stats.lines_removed += changes.lines_removed;

        let record = self
            .iterations
            .last_mut()
            .ok_or_else(|| RalphError::InvalidState("No iteration to end".to_string()))?;
        record.seal(outcome, changes.commits);
        Ok(record)
    }

    pub fn set_task_counts(&mut self, complete: usize, total: usize) {
        self.stats.tasks_complete = complete;
        self.stats.total_tasks = total;
    }

    /// Set the idle flag. Returns true if it changed.
    pub fn set_idle(&mut self, idle: bool) -> bool {
        if self.idle == idle || (idle && self.status != LoopStatus::Executing) {
            return false;
        }
        self.idle = idle;
        true
    }

    /// Ask for a pause at the next iteration boundary. Returns false if not applicable.
    pub fn request_pause(&mut self) -> bool {
        let from = self.status;
        if self.transition(LoopStatus::Pausing).is_err() {
            return false;
        }
        self.paused_from = from;
        true
    }

    /// Complete a requested pause.
    pub fn enter_paused(&mut self) -> Result<()> {
        self.transition(LoopStatus::Paused)
    }

    /// Resume from `Paused`, or withdraw a pending pause.
    ///
    /// Returns true only when leaving `Paused`.
    pub fn resume(&mut self) -> bool {
        match self.status {
            LoopStatus::Paused => self.transition(LoopStatus::Running).is_ok(),
            LoopStatus::Pausing => {
                let back = self.paused_from;
                // Ready has no direct edge back from Pausing
                let back = if back == LoopStatus::Ready { LoopStatus::Running } else { back };
                let _ = self.transition(back);
                false
            }
            _ => false,
        }
    }

    pub fn stop(&mut self) -> bool {
        self.transition(LoopStatus::Stopped).is_ok()
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(LoopStatus::Complete)
    }

    pub fn fail(&mut self) -> bool {
        self.transition(LoopStatus::Error).is_ok()
    }

    /// Record a rate limit and return how long to wait.
    pub fn record_rate_limit(&mut self, policy: &BackoffPolicy, retry_after: Option<Duration>) -> Duration {
        self.backoff.record_rate_limit(policy, retry_after)
    }

    pub fn finish_backoff(&mut self) {
        self.backoff.finish_wait();
    }

    /// Reset the backoff streak after a success. Returns the streak length if one was cleared.
    pub fn clear_backoff(&mut self) -> Option<u32> {
        let attempt = self.backoff.attempt();
        self.backoff.record_success().then_some(attempt)
    }

    /// Substitute a fallback agent. Returns false if it was already active.
    pub fn switch_agent(&mut self, fallback: &str) -> bool {
        self.agent.switch_to_fallback(fallback)
    }

    pub fn restore_primary(&mut self) -> bool {
        self.agent.restore_primary()
    }

    /// Mean sealed-iteration duration times `remaining` tasks.
    pub fn eta_ms(&self, remaining: usize) -> Option<u64> {
        let durations: Vec<Duration> = self.iterations.iter().filter_map(IterationRecord::duration).collect();
        if durations.is_empty() {
            return None;
        }
        let total: Duration = durations.iter().sum();
        let mean = total.as_millis() as u64 / durations.len() as u64;
        Some(mean * remaining as u64)
    }
}
