//! Agents run on a pseudo-terminal through the process bridge.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::definition::{AgentDefinition, PromptDelivery, builtin_agents};
use super::launcher::{AgentEvent, AgentExecution, AgentLauncher, ExecutionControl, LaunchRequest};
use crate::error::{RalphError, Result};
use crate::events::OutputStream;
use crate::process::{DEFAULT_COLS, DEFAULT_ROWS, ProcessBridge, ProcessHandle, SpawnOptions};

/// Launches agents on a pty. Output is one merged `terminal` stream.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    agents: HashMap<String, AgentDefinition>,
    cols: u16,
    rows: u16,
}

impl Default for PtyLauncher {
    fn default() -> Self {
        Self::new(builtin_agents())
    }
}

impl PtyLauncher {
    pub fn new(agents: HashMap<String, AgentDefinition>) -> Self {
        Self {
            agents,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

#[async_trait]
impl AgentLauncher for PtyLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<AgentExecution> {
        let def = self
            .agents
            .get(&request.agent_id)
            .ok_or_else(|| RalphError::Agent(format!("Unknown agent: {}", request.agent_id)))?;
        let args = def.build_args(&request.prompt, request.model.as_deref(), request.attach_url.as_deref());

        let options = SpawnOptions {
            cols: self.cols,
            rows: self.rows,
            cwd: Some(request.cwd.clone()),
            env: def.env.clone(),
        };
        let handle = ProcessBridge::spawn(&def.command, &args, options)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        handle.on_data(move |data| {
            let _ = data_tx.send(AgentEvent::Output {
                stream: OutputStream::Terminal,
                data: data.to_string(),
            });
        });
        handle.on_exit(move |exit| {
            let _ = tx.send(AgentEvent::Exit(exit.clone()));
        });

        if def.prompt == PromptDelivery::Stdin {
            let mut input = request.prompt.clone().into_bytes();
            input.push(b'\n');
            handle.write(&input)?;
        }

        Ok(AgentExecution::new(rx, Box::new(PtyControl { handle })))
    }
}

struct PtyControl {
    handle: ProcessHandle,
}

#[async_trait]
impl ExecutionControl for PtyControl {
    fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.handle.write(data)
    }

    fn cleanup(&self) {
        self.handle.cleanup();
    }
}
