//! ID and timestamp utilities for Ralph
//!
//! Provides functions for generating session identifiers and wall-clock timestamps.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique session ID
///
/// Format: `{timestamp_ms}-{random_hex}`
/// Example: `1738300800123-a1b2c3d4`
pub fn generate_session_id() -> String {
    let timestamp = now_ms();
    let random: u32 = rand::rng().random();
    format!("{}-{:08x}", timestamp, random)
}
