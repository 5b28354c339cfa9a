//! Per-upstream configuration
//!
//! Each upstream MCP server is described by a transport selector (child
//! process, streamable HTTP, or SSE), a tag set used by session filters, and
//! timeout overrides. Timeout resolution follows the rule
//! `connection = connectionTimeout || timeout` and
//! `request = requestTimeout || timeout`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Configuration for a single upstream MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Transport used to reach the upstream
    #[serde(flatten)]
    pub transport: UpstreamTransportConfig,

    /// Tags used by session filters
    #[serde(default)]
    pub tags: Vec<String>,

    /// Fallback timeout in milliseconds, applied to both connection and
    /// requests when the specific overrides are absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Connection timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,

    /// Request timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,

    /// Disabled upstreams are omitted from runtime even when listed
    #[serde(default)]
    pub disabled: bool,
}

impl UpstreamConfig {
    /// Create a config from a transport selector with no tags or overrides
    pub fn new(transport: UpstreamTransportConfig) -> Self {
        Self {
            transport,
            tags: Vec::new(),
            timeout: None,
            connection_timeout: None,
            request_timeout: None,
            disabled: false,
        }
    }

    /// Add tags to the config
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Resolved connection timeout: `connectionTimeout || timeout`
    pub fn resolved_connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout
            .or(self.timeout)
            .map(Duration::from_millis)
    }

    /// Resolved request timeout: `requestTimeout || timeout`
    pub fn resolved_request_timeout(&self) -> Option<Duration> {
        self.request_timeout
            .or(self.timeout)
            .map(Duration::from_millis)
    }

    /// Check whether the upstream carries the given tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Validate the configuration for the named upstream
    pub fn validate(&self, name: &str) -> ConfigResult<()> {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "upstream name cannot be empty".to_string(),
            ));
        }
        self.transport.validate(name)
    }
}

/// Transport selector for an upstream connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamTransportConfig {
    /// Child process reached over stdio
    #[serde(rename = "stdio", rename_all = "camelCase")]
    Stdio {
        /// Command to execute
        command: String,

        /// Command arguments
        #[serde(default)]
        args: Vec<String>,

        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,

        /// Environment variables passed to the child
        #[serde(default)]
        env: HashMap<String, String>,

        /// Whether the child inherits the parent environment
        #[serde(default = "default_true")]
        inherit_parent_env: bool,

        /// Names of parent environment variables to forward when
        /// `inheritParentEnv` is false
        #[serde(default)]
        env_filter: Vec<String>,

        /// Restart the child if it exits unexpectedly
        #[serde(default)]
        restart_on_exit: bool,

        /// Maximum number of automatic restarts
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_restarts: Option<u32>,

        /// Delay between automatic restarts
        #[serde(default = "default_restart_delay", with = "humantime_serde")]
        restart_delay: Duration,
    },

    /// Streamable HTTP endpoint
    #[serde(rename = "http", rename_all = "camelCase")]
    StreamableHttp {
        /// Base URL of the MCP endpoint
        url: String,

        /// HTTP headers to include on every request
        #[serde(default)]
        headers: HashMap<String, String>,

        /// OAuth configuration, if the upstream requires authorization
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth: Option<OauthConfig>,
    },

    /// Server-Sent Events endpoint
    #[serde(rename = "sse", rename_all = "camelCase")]
    Sse {
        /// Base URL of the SSE endpoint
        url: String,

        /// HTTP headers to include on every request
        #[serde(default)]
        headers: HashMap<String, String>,

        /// OAuth configuration, if the upstream requires authorization
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth: Option<OauthConfig>,
    },
}

impl UpstreamTransportConfig {
    /// Get the transport type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::StreamableHttp { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }

    /// Whether the transport can complete an OAuth authorization flow
    pub fn supports_oauth(&self) -> bool {
        matches!(self, Self::StreamableHttp { .. } | Self::Sse { .. })
    }

    /// Validate the transport selector
    pub fn validate(&self, name: &str) -> ConfigResult<()> {
        match self {
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ConfigError::upstream(name, "stdio command cannot be empty"));
                }
            }
            Self::StreamableHttp { url, .. } | Self::Sse { url, .. } => {
                if url.trim().is_empty() {
                    return Err(ConfigError::upstream(name, "transport URL cannot be empty"));
                }
                if let Err(e) = url::Url::parse(url) {
                    return Err(ConfigError::upstream(name, format!("invalid URL: {}", e)));
                }
            }
        }
        Ok(())
    }
}

/// OAuth configuration forwarded to HTTP transports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthConfig {
    /// Whether OAuth is enabled for this upstream
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scopes requested during authorization
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Top-level proxy configuration: a map of named upstreams
///
/// A `BTreeMap` keeps iteration order stable, which downstream consumers
/// (capability aggregation in particular) rely on for determinism.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream MCP servers keyed by unique name
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

impl ProxyConfig {
    /// Parse a YAML document into a validated configuration
    pub fn from_yaml(input: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all upstream entries
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, upstream) in &self.upstreams {
            upstream.validate(name)?;
        }
        Ok(())
    }

    /// Iterate over upstreams that are not disabled, in name order
    pub fn enabled_upstreams(&self) -> impl Iterator<Item = (&String, &UpstreamConfig)> {
        self.upstreams.iter().filter(|(_, cfg)| !cfg.disabled)
    }
}

fn default_true() -> bool {
    true
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(1)
}
