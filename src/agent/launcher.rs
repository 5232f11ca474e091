//! Agent launch abstraction.
//!
//! A launcher turns a prompt into a running agent: an ordered stream of output
//! chunks ending in exactly one exit, plus a control surface for steering and
//! teardown.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::OutputStream;
use crate::process::ProcessExit;

/// Everything needed to start one agent invocation.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub agent_id: String,
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    /// Remote server the agent should attach to, if any
    pub attach_url: Option<String>,
}

/// Output or exit from a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Output { stream: OutputStream, data: String },
    Exit(ProcessExit),
}

/// Control over a running agent.
#[async_trait]
pub trait ExecutionControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Send bytes to the agent. Dropped once cleaned up or if input is closed.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Stop delivery and kill the agent if still running. Idempotent.
    fn cleanup(&self);
}

/// A running agent invocation.
pub struct AgentExecution {
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
    pub control: Box<dyn ExecutionControl>,
}

impl AgentExecution {
    pub fn new(events: mpsc::UnboundedReceiver<AgentEvent>, control: Box<dyn ExecutionControl>) -> Self {
        Self { events, control }
    }
}

impl Drop for AgentExecution {
    fn drop(&mut self) {
        self.control.cleanup();
    }
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<AgentExecution>;
}
