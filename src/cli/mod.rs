//! CLI module for ralph - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
