//! Connector for an already-running remote agent server.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::error::{RalphError, Result};

/// Health endpoint, relative to the server origin.
pub const HEALTH_PATH: &str = "/global/health";

/// Default health-check timeout.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    Healthy,
    /// Answered, but not with 200 and `{"healthy": true}`
    Unhealthy,
    /// No answer (refused, DNS, timeout)
    Unreachable,
}

impl ServerHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, ServerHealth::Healthy)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            ServerHealth::Healthy => None,
            ServerHealth::Unhealthy => Some("unhealthy"),
            ServerHealth::Unreachable => Some("unreachable"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    healthy: bool,
}

/// Check that `raw` is an http(s) origin and return it without a trailing slash.
pub fn validate_and_normalize_server_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim()).map_err(|e| RalphError::InvalidUrl(format!("{}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(RalphError::InvalidProtocol(other.to_string())),
    }
    if parsed.host_str().is_none() {
        return Err(RalphError::InvalidUrl(format!("{}: missing host", raw)));
    }
    if !matches!(parsed.path(), "" | "/") || parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(RalphError::NotOriginOnly(raw.to_string()));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Probe the health endpoint of `url` (an already normalized origin).
pub async fn check_server_health(url: &str, timeout: Duration) -> ServerHealth {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build HTTP client: {}", e);
            return ServerHealth::Unreachable;
        }
    };
    probe(&client, url).await
}

async fn probe(client: &Client, url: &str) -> ServerHealth {
    let endpoint = format!("{}{}", url, HEALTH_PATH);
    let response = match client.get(&endpoint).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!("Health check {} failed: {}", endpoint, e);
            return ServerHealth::Unreachable;
        }
    };

    if response.status() != StatusCode::OK {
        debug!("Health check {} returned {}", endpoint, response.status());
        return ServerHealth::Unhealthy;
    }
    match response.json::<HealthBody>().await {
        Ok(body) if body.healthy => ServerHealth::Healthy,
        Ok(_) => ServerHealth::Unhealthy,
        Err(e) => {
            debug!("Health check {} returned malformed body: {}", endpoint, e);
            ServerHealth::Unhealthy
        }
    }
}

/// Validate, health-check and attach to a remote server.
pub async fn connect_to_external_server(raw_url: &str, timeout: Duration) -> Result<RemoteSession> {
    let url = validate_and_normalize_server_url(raw_url)?;
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RalphError::CannotConnect(format!("{} ({})", url, e)))?;

    let mut session = RemoteSession {
        url,
        client,
        attached: false,
    };
    session.attach().await?;
    Ok(session)
}

/// Attachment to a remote agent server. Reconnectable after `close()`.
#[derive(Debug)]
pub struct RemoteSession {
    url: String,
    client: Client,
    attached: bool,
}

impl RemoteSession {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Current health of the attached server.
    pub async fn health(&self) -> ServerHealth {
        probe(&self.client, &self.url).await
    }

    /// Re-run the health check and attach again.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.attached = false;
        self.attach().await
    }

    async fn attach(&mut self) -> Result<()> {
        match probe(&self.client, &self.url).await {
            ServerHealth::Healthy => {
                self.attached = true;
                info!("Attached to remote server {}", self.url);
                Ok(())
            }
            ServerHealth::Unhealthy => Err(RalphError::Unhealthy(self.url.clone())),
            ServerHealth::Unreachable => Err(RalphError::CannotConnect(self.url.clone())),
        }
    }

    /// Detach. Idempotent.
    pub fn close(&mut self) {
        if self.attached {
            self.attached = false;
            info!("Detached from remote server {}", self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_trailing_slash() {
        assert_eq!(
            validate_and_normalize_server_url("http://localhost:4096/").unwrap(),
            "http://localhost:4096"
        );
        assert_eq!(
            validate_and_normalize_server_url("https://agents.example.com").unwrap(),
            "https://agents.example.com"
        );
    }

    #[test]
    fn test_unparseable_url() {
        let err = validate_and_normalize_server_url("not a url").unwrap_err();
        assert!(matches!(err, RalphError::InvalidUrl(_)));
    }

    #[test]
    fn test_wrong_scheme() {
        let err = validate_and_normalize_server_url("ftp://localhost:21").unwrap_err();
        assert!(matches!(err, RalphError::InvalidProtocol(ref s) if s == "ftp"));
    }

    #[test]
    fn test_path_query_fragment_rejected() {
        for raw in [
            "http://localhost:4096/api",
            "http://localhost:4096/?a=1",
            "http://localhost:4096/#frag",
        ] {
            let err = validate_and_normalize_server_url(raw).unwrap_err();
            assert!(matches!(err, RalphError::NotOriginOnly(_)), "{}", raw);
        }
    }

    #[test]
    fn test_health_reason() {
        assert!(ServerHealth::Healthy.is_ok());
        assert_eq!(ServerHealth::Healthy.reason(), None);
        assert_eq!(ServerHealth::Unhealthy.reason(), Some("unhealthy"));
        assert_eq!(ServerHealth::Unreachable.reason(), Some("unreachable"));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Port 9 (discard) is essentially never listening on loopback
        let health = check_server_health("http://127.0.0.1:9", Duration::from_millis(500)).await;
        assert_eq!(health, ServerHealth::Unreachable);

        let err = connect_to_external_server("http://127.0.0.1:9", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Cannot connect"));
    }
}
