//! Upstream transport abstractions
//!
//! A transport moves JSON-RPC frames between the proxy and one upstream
//! server. The contract is deliberately small: `start` yields the inbound
//! event stream, `send` writes a frame, `close` tears the connection down.
//! HTTP-based transports additionally expose OAuth hooks.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use manifold_config::UpstreamTransportConfig;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::JsonRpcMessage;
use crate::upstream::http::{SseTransport, StreamableHttpTransport};
use crate::upstream::stdio::ChildProcessTransport;

/// Transport kind, mirrored from the configuration selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
    Sse,
}

impl TransportKind {
    /// Whether this kind can complete an OAuth authorization flow
    pub fn supports_oauth(&self) -> bool {
        matches!(self, Self::StreamableHttp | Self::Sse)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::StreamableHttp => "http",
            Self::Sse => "sse",
        };
        f.write_str(name)
    }
}

/// Inbound event from a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded JSON-RPC frame
    Message(JsonRpcMessage),

    /// A non-fatal transport error (bad frame, dropped chunk)
    Error(String),

    /// The peer went away; no further events follow
    Closed,
}

/// Transport contract shared by stdio, SSE, and streamable HTTP upstreams
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Open the connection and return the inbound event stream
    async fn start(&mut self) -> ProxyResult<mpsc::Receiver<TransportEvent>>;

    /// Send one JSON-RPC frame
    async fn send(&mut self, message: JsonRpcMessage) -> ProxyResult<()>;

    /// Close the connection; idempotent
    async fn close(&mut self) -> ProxyResult<()>;

    /// Which kind of transport this is
    fn kind(&self) -> TransportKind;

    /// Authorization URL captured from an OAuth challenge, if any
    fn authorization_url(&self) -> Option<String> {
        None
    }

    /// Complete a pending OAuth exchange with the given code
    async fn finish_auth(&mut self, _code: &str) -> ProxyResult<()> {
        Err(ProxyError::Configuration {
            message: format!("{} transport does not support OAuth", self.kind()),
        })
    }
}

/// Factory for upstream transports
///
/// The connect loop recreates transports between attempts through this
/// factory, and tests substitute scripted transports here.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        name: &str,
        config: &UpstreamTransportConfig,
    ) -> ProxyResult<Box<dyn UpstreamTransport>>;
}

/// Factory producing the built-in transport implementations
#[derive(Debug, Default, Clone)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        name: &str,
        config: &UpstreamTransportConfig,
    ) -> ProxyResult<Box<dyn UpstreamTransport>> {
        config
            .validate(name)
            .map_err(|e| ProxyError::Configuration {
                message: e.to_string(),
            })?;

        match config {
            UpstreamTransportConfig::Stdio {
                command,
                args,
                cwd,
                env,
                inherit_parent_env,
                env_filter,
                ..
            } => Ok(Box::new(ChildProcessTransport::new(
                command.clone(),
                args.clone(),
                cwd.clone(),
                env.clone(),
                *inherit_parent_env,
                env_filter.clone(),
            ))),
            UpstreamTransportConfig::StreamableHttp { url, headers, .. } => Ok(Box::new(
                StreamableHttpTransport::new(url.clone(), headers.clone())?,
            )),
            UpstreamTransportConfig::Sse { url, headers, .. } => {
                Ok(Box::new(SseTransport::new(url.clone(), headers.clone())?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_oauth_support() {
        assert!(!TransportKind::Stdio.supports_oauth());
        assert!(TransportKind::StreamableHttp.supports_oauth());
        assert!(TransportKind::Sse.supports_oauth());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Stdio.to_string(), "stdio");
        assert_eq!(TransportKind::StreamableHttp.to_string(), "http");
        assert_eq!(TransportKind::Sse.to_string(), "sse");
    }
}
