//! The hub gateway transport.
//!
//! The hub speaks plain HTTP GET: one URL shape per command class for
//! requests, `/buffstatus.xml` for the shared response buffer, and a hub
//! command to clear that buffer. Everything above this module sees only the
//! [`HubTransport`] trait, which is also how the test hub simulator gets
//! injected at session construction.

use crate::error::TransportError;
use async_trait::async_trait;
use insteon_wire::HexString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Request line that clears the hub's response buffer.
const CLEAR_BUFFER_LINE: &str = "/1?XB=M=1";

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hub host name or IP.
    pub host: String,
    /// Hub HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Basic-auth user.
    #[serde(default)]
    pub username: String,
    /// Basic-auth password.
    #[serde(default)]
    pub password: String,
    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Minimum spacing between commands in milliseconds.
    #[serde(default = "default_command_spacing_ms")]
    pub command_spacing_ms: u64,
    /// Base delay for the linear retry backoff in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Poll interval while waiting on the response buffer, milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_port() -> u16 {
    25105
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_command_spacing_ms() -> u64 {
    50
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            http_timeout_ms: default_http_timeout_ms(),
            command_spacing_ms: default_command_spacing_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        SessionConfig {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn command_spacing(&self) -> Duration {
        Duration::from_millis(self.command_spacing_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The hub gateway seen as three operations: send a command line, read the
/// shared response buffer, clear it.
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Issue a command request line.
    async fn send_request(&self, line: &str) -> Result<(), TransportError>;

    /// Fetch the current contents of the hub's response buffer.
    async fn read_buffer(&self) -> Result<HexString, TransportError>;

    /// Ask the hub to discard its response buffer.
    async fn clear_buffer(&self) -> Result<(), TransportError>;
}

/// HTTP transport against a physical hub.
pub struct HttpHubTransport {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpHubTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        Ok(HttpHubTransport {
            client,
            base_url: format!("http://{}:{}", config.host, config.port),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn get(&self, path: &str) -> Result<String, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        trace!(%url, "hub GET");
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(translate_reqwest)?;
        let status = response.status();
        if status.is_client_error() {
            return Err(TransportError::Rejected(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(TransportError::Failed(format!("HTTP {}", status)));
        }
        response.text().await.map_err(translate_reqwest)
    }
}

fn translate_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() || err.is_request() {
        TransportError::Interrupted(err.to_string())
    } else {
        TransportError::Failed(err.to_string())
    }
}

/// Pull the hex payload out of the `buffstatus.xml` body.
fn extract_buffer_payload(body: &str) -> Option<&str> {
    let start = body.find("<BS>")? + "<BS>".len();
    let end = body[start..].find("</BS>")? + start;
    Some(&body[start..end])
}

#[async_trait]
impl HubTransport for HttpHubTransport {
    async fn send_request(&self, line: &str) -> Result<(), TransportError> {
        self.get(line).await.map(|_| ())
    }

    async fn read_buffer(&self) -> Result<HexString, TransportError> {
        let body = self.get("/buffstatus.xml").await?;
        let payload = extract_buffer_payload(&body)
            .ok_or_else(|| TransportError::Failed("malformed buffstatus response".into()))?;
        HexString::parse(payload).map_err(|e| TransportError::Failed(e.to_string()))
    }

    async fn clear_buffer(&self) -> Result<(), TransportError> {
        debug!("clearing hub response buffer");
        self.get(CLEAR_BUFFER_LINE).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_buffer_payload() {
        let body = "<response><BS>0250AA</BS></response>";
        assert_eq!(extract_buffer_payload(body), Some("0250AA"));
        assert_eq!(extract_buffer_payload("<response></response>"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::new("192.168.1.5").with_credentials("user", "pass");
        assert_eq!(config.port, 25105);
        assert_eq!(config.command_spacing(), Duration::from_millis(50));
        assert_eq!(config.retry_base_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"host": "hub.local"}"#).unwrap();
        assert_eq!(config.host, "hub.local");
        assert_eq!(config.port, 25105);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }
}
