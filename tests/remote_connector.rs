//! Remote connector tests against an in-process HTTP stub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ralph::error::RalphError;
use ralph::remote::{ServerHealth, check_server_health, connect_to_external_server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Serve one canned response to every connection. Returns the base URL and
/// the request lines seen.
async fn stub(status: &'static str, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let requests = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let requests = requests.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                if let Some(line) = request.lines().next() {
                    requests.lock().unwrap().push(line.to_string());
                }
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), seen)
}

#[tokio::test]
async fn test_healthy_server_attaches() {
    let (url, seen) = stub("200 OK", r#"{"healthy":true,"version":"1.0"}"#).await;

    let mut session = connect_to_external_server(&format!("{}/", url), TIMEOUT).await.unwrap();
    assert_eq!(session.url(), url);
    assert!(session.is_attached());
    assert_eq!(seen.lock().unwrap()[0], "GET /global/health HTTP/1.1");

    assert_eq!(session.health().await, ServerHealth::Healthy);
    session.close();
    session.close();
    assert!(!session.is_attached());

    session.reconnect().await.unwrap();
    assert!(session.is_attached());
}

#[tokio::test]
async fn test_non_200_is_unhealthy() {
    let (url, _) = stub("503 Service Unavailable", r#"{"healthy":true}"#).await;
    assert_eq!(check_server_health(&url, TIMEOUT).await, ServerHealth::Unhealthy);
    assert!(matches!(
        connect_to_external_server(&url, TIMEOUT).await,
        Err(RalphError::Unhealthy(_))
    ));
}

#[tokio::test]
async fn test_healthy_false_is_unhealthy() {
    let (url, _) = stub("200 OK", r#"{"healthy":false}"#).await;
    assert_eq!(check_server_health(&url, TIMEOUT).await, ServerHealth::Unhealthy);
}

#[tokio::test]
async fn test_malformed_body_is_unhealthy() {
    let (url, _) = stub("200 OK", "not json").await;
    assert_eq!(check_server_health(&url, TIMEOUT).await, ServerHealth::Unhealthy);
}

#[tokio::test]
async fn test_invalid_urls_fail_before_any_request() {
    assert!(matches!(
        connect_to_external_server("ftp://localhost:4096", TIMEOUT).await,
        Err(RalphError::InvalidProtocol(_))
    ));
    assert!(matches!(
        connect_to_external_server("http://localhost:4096/api", TIMEOUT).await,
        Err(RalphError::NotOriginOnly(_))
    ));
    assert!(matches!(
        connect_to_external_server("not a url", TIMEOUT).await,
        Err(RalphError::InvalidUrl(_))
    ));
}
