//! Proxy server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::registry::DEFAULT_NAME_PATTERN;

/// Configuration for the inbound server surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,

    /// Accept a client-supplied `Mcp-Session-Id` with no persisted state,
    /// creating the session with that id verbatim. Enables proxy-behind-proxy
    /// setups at the cost of weaker session authenticity.
    pub accept_client_session_ids: bool,

    /// Pagination default for sessions that do not specify it
    pub default_pagination: bool,

    /// Page size used when pagination is on and the client sends no limit
    pub default_page_size: usize,

    /// Pattern for public tool names; must contain `{server}` and `{tool}`
    pub tool_name_pattern: String,

    /// SSE heartbeat interval
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// Idle lifetime for persisted sessions
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3050,
            accept_client_session_ids: true,
            default_pagination: false,
            default_page_size: 50,
            tool_name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            keep_alive_interval: Duration::from_secs(30),
            session_ttl: Duration::from_secs(1800),
        }
    }
}

impl ServerConfig {
    /// Bind address string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Override the bind host and port
    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Refuse client-generated session ids
    pub fn strict_session_ids(mut self) -> Self {
        self.accept_client_session_ids = false;
        self
    }
}
