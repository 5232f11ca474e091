//! Process execution layer.
//!
//! - ProcessBridge: spawn a child on a pseudo-terminal
//! - ProcessHandle: write, resize, subscribe, idempotent cleanup
//! - Utf8Decoder: chunk-safe text decoding shared with piped launches

mod bridge;
mod decode;

pub use bridge::{DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM, ProcessBridge, ProcessExit, ProcessHandle, SpawnOptions};
pub use decode::Utf8Decoder;
