//! Operator control over a running engine.

use log::debug;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::state::LoopStatus;

/// A command delivered to the engine's control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
    /// Forward a message to the running agent
    Steer(String),
}

impl ControlCommand {
    /// Parse a control line: `pause`, `resume`, `stop` or `steer <message>`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match word.to_ascii_lowercase().as_str() {
            "pause" => Some(ControlCommand::Pause),
            "resume" => Some(ControlCommand::Resume),
            "stop" | "quit" => Some(ControlCommand::Stop),
            "steer" if !rest.trim().is_empty() => Some(ControlCommand::Steer(rest.trim().to_string())),
            _ => None,
        }
    }
}

/// Cloneable handle for pausing, resuming, stopping and steering an engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    cancel: CancellationToken,
    status: watch::Receiver<LoopStatus>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<ControlCommand>,
        cancel: CancellationToken,
        status: watch::Receiver<LoopStatus>,
    ) -> Self {
        Self {
            commands,
            cancel,
            status,
        }
    }

    fn send(&self, command: ControlCommand) {
        if self.commands.send(command).is_err() {
            debug!("Engine is gone, control command dropped");
        }
    }

    pub fn pause(&self) {
        self.send(ControlCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(ControlCommand::Resume);
    }

    /// Stop the engine. Pending waits are cancelled immediately.
    pub fn stop(&self) {
        self.send(ControlCommand::Stop);
        self.cancel.cancel();
    }

    /// Send a message to the running agent without changing state.
    pub fn steer(&self, message: impl Into<String>) {
        self.send(ControlCommand::Steer(message.into()));
    }

    pub fn dispatch(&self, command: ControlCommand) {
        match command {
            ControlCommand::Stop => self.stop(),
            other => self.send(other),
        }
    }

    pub fn status(&self) -> LoopStatus {
        *self.status.borrow()
    }

    /// Wait until the status changes and return the new value.
    pub async fn changed(&mut self) -> Option<LoopStatus> {
        self.status.changed().await.ok()?;
        Some(*self.status.borrow_and_update())
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_lines() {
        assert_eq!(ControlCommand::parse("pause"), Some(ControlCommand::Pause));
        assert_eq!(ControlCommand::parse("  RESUME \n"), Some(ControlCommand::Resume));
        assert_eq!(ControlCommand::parse("stop"), Some(ControlCommand::Stop));
        assert_eq!(
            ControlCommand::parse("steer focus on the tests"),
            Some(ControlCommand::Steer("focus on the tests".to_string()))
        );
        assert_eq!(ControlCommand::parse("steer   "), None);
        assert_eq!(ControlCommand::parse("dance"), None);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_sends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel(LoopStatus::Running);
        let handle = EngineHandle::new(tx, CancellationToken::new(), status_rx);

        handle.steer("hi");
        handle.stop();
        assert!(handle.is_stopping());
        assert_eq!(rx.recv().await, Some(ControlCommand::Steer("hi".to_string())));
        assert_eq!(rx.recv().await, Some(ControlCommand::Stop));
        assert_eq!(handle.status(), LoopStatus::Running);
    }
}
