//! Agent execution: definitions, launchers and output parsing.

mod command;
mod definition;
mod launcher;
mod pty;
mod stream;

pub use command::CommandLauncher;
pub use definition::{AgentDefinition, PromptDelivery, builtin_agents};
pub use launcher::{AgentEvent, AgentExecution, AgentLauncher, ExecutionControl, LaunchRequest};
pub use pty::PtyLauncher;
pub use stream::{LineBuffer, parse_stream_line};
