//! Ralph - drive an AI coding agent against a task plan
//!
//! Ralph runs the agent in a loop with fresh context per task: one iteration per
//! task, the plan file as the only memory. The engine survives rate limits with
//! backoff and fallback agents, guards its working directory with a session lock
//! and reports everything as a stream of headless JSON events.

pub mod agent;
pub mod engine;
pub mod error;
pub mod events;
pub mod id;
pub mod process;
pub mod prompt;
pub mod ratelimit;
pub mod remote;
pub mod repo;
pub mod session;
pub mod tasks;

pub use error::{RalphError, Result};
