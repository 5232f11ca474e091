//! Rate-limit detection over agent diagnostics.
//!
//! The detector only ever looks at stderr. Stdout carries the agent's work, and
//! source code routinely contains phrases like "rate limit".

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::process::ProcessExit;

/// Retry-after hints at or above this are ignored.
pub const MAX_RETRY_AFTER_SECS: i64 = 3600;

/// Longest message excerpt before truncation.
pub const MAX_MESSAGE_CHARS: usize = 200;

const CONTEXT_BEFORE: usize = 40;
const CONTEXT_AFTER: usize = 200;

/// Everything the detector may consult about one agent run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionInput<'a> {
    pub stderr: &'a str,
    /// Accepted for symmetry with the process result; never inspected.
    pub stdout: Option<&'a str>,
    pub exit_code: Option<i32>,
    /// Set when the agent was killed by a signal.
    pub signal: Option<&'a str>,
    pub agent_id: Option<&'a str>,
}

impl<'a> DetectionInput<'a> {
    pub fn new(stderr: &'a str, exit_code: Option<i32>) -> Self {
        Self {
            stderr,
            exit_code,
            ..Default::default()
        }
    }

    /// Input for a finished agent process.
    pub fn from_exit(stderr: &'a str, exit: &'a ProcessExit) -> Self {
        Self {
            stderr,
            exit_code: exit.exit_code,
            signal: exit.signal.as_deref(),
            ..Default::default()
        }
    }

    pub fn with_signal(mut self, signal: &'a str) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_agent(mut self, agent_id: &'a str) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_stdout(mut self, stdout: &'a str) -> Self {
        self.stdout = Some(stdout);
        self
    }

    fn abnormal_exit(&self) -> bool {
        self.signal.is_some() || matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// Classification of one observation. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitVerdict {
    pub is_rate_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitVerdict {
    pub fn none() -> Self {
        Self::default()
    }
}

struct Phrase {
    regex: Regex,
    /// Loose phrases also appear in unrelated failures, so they need an abnormal exit.
    loose: bool,
}

fn compile(table: &[(&str, bool)]) -> Vec<Phrase> {
    table
        .iter()
        .map(|(pattern, loose)| Phrase {
            regex: Regex::new(&format!("(?i){}", pattern)).expect("static rate-limit pattern"),
            loose: *loose,
        })
        .collect()
}

static COMMON_PHRASES: LazyLock<Vec<Phrase>> = LazyLock::new(|| {
    compile(&[
        (r"(?:http|status|error|code)\D{0,16}\b429\b", false),
        (r"\b429\b\s*[:\-]?\s*(?:too many|rate)", false),
        (r"too many requests", false),
        (r"rate[\s_\-]?limit(?:ed|s)?", false),
        (r"quota\s+(?:exceeded|exhausted)", false),
        (r"\boverloaded\b", true),
        (r"\bthrottl(?:ed|ing)\b", true),
        (r"\bat capacity\b", true),
        (r"\bback[\s\-]?off\b", true),
    ])
});

static AGENT_PHRASES: LazyLock<HashMap<&'static str, Vec<Phrase>>> = LazyLock::new(|| {
    let mut phrases = HashMap::new();
    phrases.insert(
        "claude",
        compile(&[
            (r"rate_limit_error", false),
            (r"overloaded_error", false),
            (r"usage limit reached", false),
            (r"\d+-hour limit reached", false),
        ]),
    );
    phrases.insert(
        "opencode",
        compile(&[(r"ratelimiterror", false), (r"provider .{0,40}rate limit", false)]),
    );
    phrases.insert(
        "codex",
        compile(&[(r"rate limit reached for", false), (r"hit your usage limit", false)]),
    );
    phrases.insert(
        "gemini",
        compile(&[(r"resource_exhausted", false), (r"resource has been exhausted", false)]),
    );
    phrases
});

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry|try again)(?:[\-_\s]?after)?\s*[:=]?\s*(?:in\s+)?(-?\d+)\s*(?:seconds?|secs?|s)\b",
    )
    .expect("static retry-after pattern")
});

/// Stateless rate-limit classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimitDetector;

impl RateLimitDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify one agent run.
    pub fn detect(&self, input: &DetectionInput<'_>) -> RateLimitVerdict {
        if input.stderr.trim().is_empty() {
            return RateLimitVerdict::none();
        }

        let agent_phrases = input
            .agent_id
            .and_then(|id| AGENT_PHRASES.get(id.to_ascii_lowercase().as_str()));

        let hit = agent_phrases
            .and_then(|phrases| first_match(phrases, input))
            .or_else(|| first_match(&COMMON_PHRASES, input));

        match hit {
            Some((start, end)) => RateLimitVerdict {
                is_rate_limit: true,
                retry_after_seconds: extract_retry_after(input.stderr),
                message: Some(excerpt(input.stderr, start, end)),
            },
            None => RateLimitVerdict::none(),
        }
    }
}

/// Convenience wrapper around `RateLimitDetector::detect`.
pub fn detect(input: &DetectionInput<'_>) -> RateLimitVerdict {
    RateLimitDetector.detect(input)
}

fn first_match(phrases: &[Phrase], input: &DetectionInput<'_>) -> Option<(usize, usize)> {
    phrases
        .iter()
        .filter(|phrase| !phrase.loose || input.abnormal_exit())
        .find_map(|phrase| phrase.regex.find(input.stderr).map(|m| (m.start(), m.end())))
}

/// First integer followed by a seconds unit near a "retry" keyword.
pub fn extract_retry_after(text: &str) -> Option<u64> {
    let caps = RETRY_AFTER.captures(text)?;
    let value: i64 = caps.get(1)?.as_str().parse().ok()?;
    if (0..MAX_RETRY_AFTER_SECS).contains(&value) {
        Some(value as u64)
    } else {
        None
    }
}

fn excerpt(text: &str, start: usize, end: usize) -> String {
    let mut from = start.saturating_sub(CONTEXT_BEFORE);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + CONTEXT_AFTER).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }

    let window = text[from..to].split_whitespace().collect::<Vec<_>>().join(" ");
    if window.chars().count() > MAX_MESSAGE_CHARS {
        let truncated: String = window.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{}...", truncated)
    } else {
        window
    }
}
