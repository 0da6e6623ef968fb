//! JSON-over-HTTP client used for all device communication.
//!
//! Wraps a shared [`reqwest::Client`] and converts every library error into
//! the crate's own [`ScanError`] taxonomy — callers never see a
//! `reqwest::Error`. Transport failures are retried transparently with a
//! capped exponential backoff; payload failures are surfaced immediately.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ScanError;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Additional attempts after the first failure.
const MAX_RETRIES: u32 = 2;
const INITIAL_RETRY_DELAY_SECS: f64 = 1.0;
const RETRY_BACKOFF: f64 = 1.5;
const MAX_RETRY_DELAY_SECS: f64 = 5.0;

const USER_AGENT: &str = concat!("scopenode/", env!("CARGO_PKG_VERSION"));

/// HTTP JSON client with retry.
///
/// Holds `None` when the underlying client could not be constructed (e.g.
/// no usable TLS backend); every request then fails with a typed error
/// instead of the process panicking at startup.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: Option<reqwest::Client>,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new(default_timeout: Duration) -> Self {
        let http = match reqwest::Client::builder().user_agent(USER_AGENT).build() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "Failed to build HTTP client; device requests will fail");
                None
            }
        };
        HttpClient {
            http,
            default_timeout,
        }
    }

    fn client(&self, url: &str) -> Result<&reqwest::Client, ScanError> {
        self.http.as_ref().ok_or_else(|| ScanError::Network {
            url: url.to_string(),
            message: "HTTP client unavailable".into(),
        })
    }

    /// Fetch JSON from `url`, optionally POSTing `post_data` as a JSON body.
    ///
    /// Transport errors (refused, timeout, HTTP >= 400, connection lost) are
    /// retried up to two more times with exponential backoff capped at 5 s
    /// between attempts. Empty or malformed payloads are not retried.
    pub async fn get_json(
        &self,
        url: &str,
        timeout: Option<Duration>,
        post_data: Option<&Value>,
    ) -> Result<Value, ScanError> {
        let client = self.client(url)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut delay = INITIAL_RETRY_DELAY_SECS;

        for attempt in 0..=MAX_RETRIES {
            match self.attempt(client, url, timeout, post_data).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport() && attempt < MAX_RETRIES => {
                    debug!(
                        url = %url,
                        attempt = attempt + 1,
                        error = %e,
                        "retrying request"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(
                        delay.min(MAX_RETRY_DELAY_SECS),
                    ))
                    .await;
                    delay *= RETRY_BACKOFF;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// Fetch a raw (non-JSON) resource, e.g. a device snapshot image.
    /// No retries: image fetches are cheap to reissue at the call site.
    pub async fn get_bytes(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ScanError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let response = self
            .client(url)?
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, url))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ScanError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, url))?;
        Ok(body.to_vec())
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        url: &str,
        timeout: Duration,
        post_data: Option<&Value>,
    ) -> Result<Value, ScanError> {
        let request = match post_data {
            Some(body) => client.post(url).json(body),
            None => client.get(url),
        };

        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, url))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ScanError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, url))?;

        if body.is_empty() {
            return Err(ScanError::Payload {
                url: url.to_string(),
                message: "empty response".into(),
            });
        }

        serde_json::from_slice(&body).map_err(|e| ScanError::Payload {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Map a `reqwest::Error` onto the crate taxonomy. The source chain is
/// walked to recognise an actively refused connection, which the polling
/// loop treats as evidence of a shutdown.
fn classify_reqwest_error(err: reqwest::Error, url: &str) -> ScanError {
    if err.is_timeout() {
        return ScanError::Timeout {
            url: url.to_string(),
        };
    }
    if is_connection_refused(&err) {
        return ScanError::Refused {
            url: url.to_string(),
        };
    }
    ScanError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spawn a one-shot HTTP server answering every request with the given
    /// status line and body.
    async fn spawn_http(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind random port");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = sock.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\n\
                         Content-Type: application/json\r\n\
                         Content-Length: {}\r\n\
                         Connection: close\r\n\r\n{body}",
                        body.len(),
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                });
            }
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_get_json_ok() {
        let base = spawn_http("200 OK", r#"{"id": "abc123"}"#).await;
        let client = HttpClient::new(DEFAULT_TIMEOUT);

        let value = client.get_json(&base, None, None).await.unwrap();
        assert_eq!(value["id"], "abc123");
    }

    #[tokio::test]
    async fn test_post_json_ok() {
        let base = spawn_http("200 OK", r#"{"ok": true}"#).await;
        let client = HttpClient::new(DEFAULT_TIMEOUT);

        let body = serde_json::json!({"setting": 1});
        let value = client.get_json(&base, None, Some(&body)).await.unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_empty_body_is_payload_error() {
        let base = spawn_http("200 OK", "").await;
        let client = HttpClient::new(DEFAULT_TIMEOUT);

        let err = client.get_json(&base, None, None).await.unwrap_err();
        assert!(matches!(err, ScanError::Payload { .. }));
    }

    #[tokio::test]
    async fn test_malformed_json_is_payload_error() {
        let base = spawn_http("200 OK", "not json at all").await;
        let client = HttpClient::new(DEFAULT_TIMEOUT);

        let err = client.get_json(&base, None, None).await.unwrap_err();
        assert!(matches!(err, ScanError::Payload { .. }));
    }

    #[tokio::test]
    async fn test_http_error_status_surfaces_after_retries() {
        let base = spawn_http("500 Internal Server Error", r#"{"err": true}"#).await;
        let client = HttpClient::new(DEFAULT_TIMEOUT);

        let err = client.get_json(&base, None, None).await.unwrap_err();
        match err {
            ScanError::HttpStatus { status, .. } => assert_eq!(status, 500),
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_detected() {
        // Bind then immediately drop the listener so the port is closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::new(Duration::from_secs(2));
        let err = client
            .get_json(&format!("http://{addr}/id"), None, None)
            .await
            .unwrap_err();
        assert!(
            err.is_connection_refused(),
            "expected Refused, got {err:?}"
        );
    }
}
