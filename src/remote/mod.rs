//! Remote agent server attachment.

mod connector;

pub use connector::{
    DEFAULT_HEALTH_TIMEOUT, HEALTH_PATH, RemoteSession, ServerHealth, check_server_health, connect_to_external_server,
    validate_and_normalize_server_url,
};
