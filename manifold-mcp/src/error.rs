//! Error types for proxy operations

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Proxy error taxonomy
///
/// Carried as structured variants rather than strings so callers can route on
/// kind. The enum is `Clone` because connect attempts and schema loads are
/// shared between concurrent waiters.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyError {
    /// No upstream, tool, or session with the given key
    #[error("{resource} not found: {name}")]
    NotFound { resource: String, name: String },

    /// Upstream exists but is not connected
    #[error("Upstream not connected: {upstream}")]
    NotConnected { upstream: String },

    /// All connection retries exhausted
    #[error("Connection failed for {upstream}: {message}")]
    ConnectionFailed { upstream: String, message: String },

    /// Upstream self-identified as this proxy
    #[error("Upstream {upstream} resolves back to this proxy")]
    CircularDependency { upstream: String },

    /// Upstream demanded authorization; parked until the OAuth flow finishes
    #[error("Upstream {upstream} requires OAuth authorization")]
    OauthRequired {
        upstream: String,
        authorization_url: Option<String>,
    },

    /// An inbound or internal cancel signal fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Capability merge saw divergent non-notification values
    #[error("Capability conflict on {category}.{key}")]
    CapabilityConflict { category: String, key: String },

    /// Request shape wrong (missing session id, bad cursor, mismatched transport)
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// Invoke routed to an upstream in Error or Disconnected state
    #[error("Upstream unavailable: {upstream}")]
    UpstreamUnavailable { upstream: String },

    /// Transport-level failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Protocol-level failure (invalid JSON-RPC, unexpected message shape)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Operation exceeded its deadline
    #[error("Timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Configuration problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Session-layer failure
    #[error("Session error: {message}")]
    Session { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create a not-connected error
    pub fn not_connected(upstream: impl Into<String>) -> Self {
        Self::NotConnected {
            upstream: upstream.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid-params error
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the connect loop may retry after this error.
    ///
    /// OAuth demands, circular-dependency refusals, and cancellation are
    /// terminal for an attempt sequence; transport-level failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::ConnectionFailed { .. }
            | Self::NotConnected { .. } => true,

            Self::OauthRequired { .. }
            | Self::CircularDependency { .. }
            | Self::Cancelled
            | Self::InvalidParams { .. }
            | Self::Configuration { .. } => false,

            _ => false,
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidParams { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::BAD_REQUEST,
            Self::Protocol { .. } => StatusCode::BAD_REQUEST,
            Self::OauthRequired { .. } => StatusCode::UNAUTHORIZED,
            Self::NotConnected { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::ConnectionFailed { .. }
            | Self::CircularDependency { .. }
            | Self::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::CapabilityConflict { .. }
            | Self::Serialization { .. }
            | Self::Session { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code for this error
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Protocol { .. } => -32600,
            Self::NotFound { .. } => -32601,
            Self::InvalidParams { .. } => -32602,
            Self::Cancelled => -32800,
            Self::NotConnected { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::ConnectionFailed { .. }
            | Self::OauthRequired { .. }
            | Self::CircularDependency { .. } => -32000,
            _ => -32603,
        }
    }

    /// Sanitized message for external clients
    pub fn client_message(&self) -> String {
        match self {
            Self::NotFound { resource, name } => format!("{} '{}' not found", resource, name),
            Self::InvalidParams { message } => message.clone(),
            Self::Protocol { message } => message.clone(),
            Self::NotConnected { upstream } | Self::UpstreamUnavailable { upstream } => {
                format!("Upstream '{}' is unavailable", upstream)
            }
            Self::OauthRequired { upstream, .. } => {
                format!("Upstream '{}' requires authorization", upstream)
            }
            Self::Timeout { .. } | Self::Cancelled => "Request timed out".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

/// Error body for HTTP endpoints
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: i32,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.client_message(),
            code: self.jsonrpc_code(),
        };
        (status, Json(body)).into_response()
    }
}

// Standard error conversions
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ProxyError::Timeout {
                timeout: Duration::from_secs(30),
            },
            _ => ProxyError::Transport {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::Configuration {
            message: format!("Invalid URL: {}", err),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout {
                timeout: Duration::from_secs(30),
            }
        } else if err.is_connect() {
            ProxyError::Transport {
                message: format!("connect failed: {}", err),
            }
        } else {
            ProxyError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout {
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Internal {
            message: err.to_string(),
        }
    }
}
