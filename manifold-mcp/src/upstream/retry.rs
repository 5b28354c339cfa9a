//! Connect-with-retry for upstream clients
//!
//! Attempts are bounded by `max_attempts` with exponential backoff starting
//! at `initial_delay`. The backoff sleep is cancel-aware, transports are
//! recreated through the factory between attempts, an OAuth challenge parks
//! the attempt sequence immediately, and an upstream that identifies itself
//! as this proxy is refused without retry.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use manifold_config::UpstreamConfig;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{InitializeResult, ServerInfo};
use crate::upstream::client::UpstreamClient;
use crate::upstream::transport::TransportFactory;

/// Retry parameters for upstream connection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPolicy {
    /// Maximum number of connection attempts
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles each further attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectPolicy {
    /// Backoff delay after the given zero-based attempt
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay * 2u32.saturating_pow(attempt)
    }
}

/// Terminal outcome of a successful attempt sequence
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Handshake completed; the upstream is usable
    Connected {
        client: Arc<UpstreamClient>,
        init: InitializeResult,
    },

    /// The upstream demanded authorization. The client (and its transport)
    /// is kept alive so `finish_auth` can run against it later.
    AwaitingOauth {
        client: Arc<UpstreamClient>,
        authorization_url: Option<String>,
    },
}

/// Connect and initialize an upstream, retrying transient failures
pub async fn connect_with_retry(
    name: &str,
    config: &UpstreamConfig,
    factory: &dyn TransportFactory,
    policy: &ConnectPolicy,
    proxy_info: &ServerInfo,
    cancel: &CancellationToken,
) -> ProxyResult<ConnectOutcome> {
    let mut last_error = ProxyError::ConnectionFailed {
        upstream: name.to_string(),
        message: "no attempts made".to_string(),
    };

    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let transport = factory.create(name, &config.transport).await?;
        let client = Arc::new(UpstreamClient::new(
            name,
            transport,
            config.resolved_request_timeout(),
        ));

        let handshake = async {
            client.connect(config.resolved_connection_timeout()).await?;
            client.initialize(proxy_info.clone()).await
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            result = handshake => result,
        };

        match result {
            Ok(init) => {
                if init.server_info.name == proxy_info.name {
                    let _ = client.close().await;
                    return Err(ProxyError::CircularDependency {
                        upstream: name.to_string(),
                    });
                }
                if attempt > 0 {
                    debug!(upstream = %name, attempt = attempt + 1, "connected after retries");
                }
                return Ok(ConnectOutcome::Connected { client, init });
            }
            Err(ProxyError::OauthRequired {
                authorization_url, ..
            }) => {
                let authorization_url = match authorization_url {
                    Some(url) => Some(url),
                    None => client.authorization_url().await,
                };
                return Ok(ConnectOutcome::AwaitingOauth {
                    client,
                    authorization_url,
                });
            }
            Err(ProxyError::Cancelled) => {
                let _ = client.close().await;
                return Err(ProxyError::Cancelled);
            }
            Err(e) if !e.is_retryable() => {
                let _ = client.close().await;
                return Err(e);
            }
            Err(e) => {
                let _ = client.close().await;
                warn!(
                    upstream = %name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "connection attempt failed"
                );
                last_error = e;

                if attempt + 1 < policy.max_attempts {
                    let delay = policy.delay_after_attempt(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    Err(ProxyError::ConnectionFailed {
        upstream: name.to_string(),
        message: last_error.to_string(),
    })
}
