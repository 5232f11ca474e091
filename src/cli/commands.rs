//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: drive an agent through the task plan
//! - status: report the session lock holder
//! - unlock: remove a stale session lock

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Ralph - drive an AI coding agent through a task plan
#[derive(Parser, Debug)]
#[command(name = "ralph")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Working directory (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    pub dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the loop until the plan is complete or the loop is stopped
    Run(RunArgs),

    /// Show who holds the session lock
    Status,

    /// Remove the session lock
    Unlock {
        /// Remove the lock even if its holder is alive
        #[arg(short, long)]
        force: bool,
    },
}

/// Flags for `ralph run`; each overrides the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Primary agent id
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Agent to switch to when the primary is rate limited
    #[arg(long)]
    pub fallback_agent: Option<String>,

    /// Task plan file
    #[arg(short, long)]
    pub plan: Option<PathBuf>,

    /// Take over the session lock even if its holder is alive
    #[arg(short, long)]
    pub force: bool,

    /// Attach to a running agent server
    #[arg(long)]
    pub server: Option<String>,

    /// Stop after this many iterations
    #[arg(short = 'n', long)]
    pub max_iterations: Option<u32>,

    /// Skip failing tasks instead of halting
    #[arg(long)]
    pub continue_on_error: bool,

    /// Stamp each event with a timestamp
    #[arg(long)]
    pub timestamps: bool,

    /// Run the agent in a pseudo-terminal
    #[arg(long)]
    pub pty: bool,

    /// Model id passed to the agent
    #[arg(short, long)]
    pub model: Option<String>,

    /// Read pause/resume/stop/steer commands from stdin
    #[arg(long)]
    pub control_stdin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn run_args(cli: Cli) -> RunArgs {
        match cli.command {
            Commands::Run(args) => args,
            other => panic!("Expected run command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["ralph"]).is_err());
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["ralph", "run"]).unwrap();
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
        let args = run_args(cli);
        assert!(args.agent.is_none());
        assert!(!args.force);
        assert!(!args.control_stdin);
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "ralph",
            "run",
            "--agent",
            "opencode",
            "--fallback-agent",
            "claude",
            "--plan",
            "docs/prd.json",
            "--force",
            "--server",
            "http://localhost:4096",
            "-n",
            "3",
            "--continue-on-error",
            "--timestamps",
            "--pty",
            "--model",
            "sonnet",
            "--control-stdin",
        ])
        .unwrap();
        let args = run_args(cli);
        assert_eq!(args.agent.as_deref(), Some("opencode"));
        assert_eq!(args.fallback_agent.as_deref(), Some("claude"));
        assert_eq!(args.plan, Some(PathBuf::from("docs/prd.json")));
        assert!(args.force);
        assert_eq!(args.server.as_deref(), Some("http://localhost:4096"));
        assert_eq!(args.max_iterations, Some(3));
        assert!(args.continue_on_error);
        assert!(args.timestamps);
        assert!(args.pty);
        assert_eq!(args.model.as_deref(), Some("sonnet"));
        assert!(args.control_stdin);
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from(["ralph", "status", "-v", "-c", "/tmp/ralph.yml", "-C", "/work"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/ralph.yml")));
        assert_eq!(cli.dir, Some(PathBuf::from("/work")));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_unlock_force() {
        let cli = Cli::try_parse_from(["ralph", "unlock", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Unlock { force: true }));
    }

    #[test]
    fn test_help_works() {
        Cli::command().debug_assert();
    }
}
