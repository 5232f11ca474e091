//! Error types for Ralph
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Ralph
#[derive(Debug, Error)]
pub enum RalphError {
    /// Another live instance holds the session lock
    #[error("Another ralph session is running (pid {pid})")]
    LockContention { pid: u32 },

    /// Lock file could not be read or written
    #[error("Lock error: {0}")]
    Lock(String),

    /// Pseudo-terminal or child process failure
    #[error("Process error: {0}")]
    Process(String),

    /// Agent could not be launched
    #[error("Agent error: {0}")]
    Agent(String),

    /// Task plan could not be read or updated
    #[error("Task source error: {0}")]
    TaskSource(String),

    /// Server URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Server URL uses a scheme other than http/https
    #[error("Invalid protocol: {0} (expected http or https)")]
    InvalidProtocol(String),

    /// Server URL carries a path, query or fragment
    #[error("Server URL must be origin only: {0}")]
    NotOriginOnly(String),

    /// Remote server did not answer
    #[error("Cannot connect to server at {0}")]
    CannotConnect(String),

    /// Remote server answered but reported itself unhealthy
    #[error("Server unhealthy at {0}")]
    Unhealthy(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration problem
    #[error("Config error: {0}")]
    Config(String),

    /// Prompt template problem
    #[error("Template error: {0}")]
    Template(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Ralph operations
pub type Result<T> = std::result::Result<T, RalphError>;
