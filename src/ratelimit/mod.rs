//! Rate-limit handling.
//!
//! - RateLimitDetector: classify agent stderr/exit code
//! - BackoffPolicy / BackoffState: how long to wait, and the running streak
//! - FallbackResolver / ActiveAgentState: which agent to run while limited

mod backoff;
mod detector;
mod fallback;

pub use backoff::{BackoffPolicy, BackoffState, DEFAULT_BASE_MS, DEFAULT_JITTER, DEFAULT_MAX_MS, calculate_backoff_ms};
pub use detector::{
    DetectionInput, MAX_MESSAGE_CHARS, MAX_RETRY_AFTER_SECS, RateLimitDetector, RateLimitVerdict, detect,
    extract_retry_after,
};
pub use fallback::{ActiveAgentState, AgentReason, FallbackResolver};
