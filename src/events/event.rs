//! Headless event types.
//!
//! One closed set of variants; every engine milestone maps to exactly one of them.
//! Serialized as one JSON object per event with a `type` tag.

use serde::{Deserialize, Serialize};

use crate::ratelimit::AgentReason;

/// Where a chunk of agent output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Merged pseudo-terminal transcript
    Terminal,
}

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Completed,
    RateLimited,
    Failed,
    Interrupted,
}

/// How the agent is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    Local,
    Remote,
}

/// Aggregate run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Run start, Unix ms
    pub start_time: u64,
    pub iterations: u32,
    pub tasks_complete: usize,
    pub total_tasks: usize,
    pub commits: u32,
    pub lines_added: u64,
    pub lines_removed: u64,
}

impl StatsSnapshot {
    pub fn new(start_time: u64) -> Self {
        Self {
            start_time,
            ..Default::default()
        }
    }
}

/// A single headless event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadlessEvent {
    IterationStart {
        iteration: u32,
        task_id: String,
        task_title: String,
        agent_id: String,
    },
    IterationEnd {
        iteration: u32,
        task_id: String,
        duration_ms: u64,
        commits: u32,
        outcome: IterationOutcome,
    },
    Tool {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
    Reasoning {
        text: String,
    },
    Progress {
        task_id: String,
        tasks_complete: usize,
        total_tasks: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_ms: Option<u64>,
    },
    Stats(StatsSnapshot),
    Pause,
    Resume,
    Idle {
        idle: bool,
    },
    Complete {
        iterations: u32,
        tasks_complete: usize,
        total_tasks: usize,
    },
    Error {
        message: String,
        fatal: bool,
    },
    Backoff {
        attempt: u32,
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
        agent_id: String,
    },
    BackoffCleared {
        attempt: u32,
    },
    Tokens {
        input: u64,
        output: u64,
    },
    Model {
        model: String,
    },
    Sandbox {
        mode: String,
    },
    RateLimit {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    ActiveAgent {
        agent_id: String,
        reason: AgentReason,
    },
    Session {
        session_id: String,
        pid: u32,
        cwd: String,
    },
    Output {
        stream: OutputStream,
        data: String,
    },
    Prompt {
        task_id: String,
        prompt: String,
    },
    AdapterMode {
        mode: AdapterMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    PlanModified {
        path: String,
    },
}

impl HeadlessEvent {
    /// The `type` tag this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            HeadlessEvent::IterationStart { .. } => "iteration_start",
            HeadlessEvent::IterationEnd { .. } => "iteration_end",
            HeadlessEvent::Tool { .. } => "tool",
            HeadlessEvent::Reasoning { .. } => "reasoning",
            HeadlessEvent::Progress { .. } => "progress",
            HeadlessEvent::Stats(_) => "stats",
            HeadlessEvent::Pause => "pause",
            HeadlessEvent::Resume => "resume",
            HeadlessEvent::Idle { .. } => "idle",
            HeadlessEvent::Complete { .. } => "complete",
            HeadlessEvent::Error { .. } => "error",
            HeadlessEvent::Backoff { .. } => "backoff",
            HeadlessEvent::BackoffCleared { .. } => "backoff_cleared",
            HeadlessEvent::Tokens { .. } => "tokens",
            HeadlessEvent::Model { .. } => "model",
            HeadlessEvent::Sandbox { .. } => "sandbox",
            HeadlessEvent::RateLimit { .. } => "rate_limit",
            HeadlessEvent::ActiveAgent { .. } => "active_agent",
            HeadlessEvent::Session { .. } => "session",
            HeadlessEvent::Output { .. } => "output",
            HeadlessEvent::Prompt { .. } => "prompt",
            HeadlessEvent::AdapterMode { .. } => "adapter_mode",
            HeadlessEvent::PlanModified { .. } => "plan_modified",
        }
    }

    pub fn output(stream: OutputStream, data: impl Into<String>) -> Self {
        HeadlessEvent::Output {
            stream,
            data: data.into(),
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        HeadlessEvent::Error {
            message: message.into(),
            fatal,
        }
    }
}

/// An event as handed to a formatter, optionally timestamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(flatten)]
    pub event: HeadlessEvent,
    /// Unix ms, present only when timestamping is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matches_kind() {
        let events = vec![
            HeadlessEvent::Pause,
            HeadlessEvent::Idle { idle: true },
            HeadlessEvent::Stats(StatsSnapshot::new(1)),
            HeadlessEvent::BackoffCleared { attempt: 2 },
            HeadlessEvent::AdapterMode {
                mode: AdapterMode::Local,
                url: None,
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_stats_fields_flattened() {
        let mut stats = StatsSnapshot::new(1000);
        stats.commits = 3;
        let value = serde_json::to_value(HeadlessEvent::Stats(stats)).unwrap();
        assert_eq!(value["type"], "stats");
        assert_eq!(value["start_time"], 1000);
        assert_eq!(value["commits"], 3);
    }

    #[test]
    fn test_record_timestamp_optional() {
        let record = EventRecord {
            event: HeadlessEvent::Resume,
            timestamp: None,
        };
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"{"type":"resume"}"#);

        let record = EventRecord {
            event: HeadlessEvent::Resume,
            timestamp: Some(42),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_record_roundtrip_with_enum_fields() {
        let record = EventRecord {
            event: HeadlessEvent::ActiveAgent {
                agent_id: "opencode".to_string(),
                reason: AgentReason::Fallback,
            },
            timestamp: Some(7),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""reason":"fallback""#));
        let parsed: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_iteration_outcome_serialization() {
        let event = HeadlessEvent::IterationEnd {
            iteration: 1,
            task_id: "US-001".to_string(),
            duration_ms: 10,
            commits: 1,
            outcome: IterationOutcome::RateLimited,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["outcome"], "rate_limited");
    }
}
