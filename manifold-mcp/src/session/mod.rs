//! Inbound session model
//!
//! A session is one downstream MCP conversation: an opaque id, a tag filter
//! selecting the upstreams it may see, a pagination flag, an optional
//! instruction template, and optional client context. Live sessions are held
//! in memory by the router; streamable HTTP sessions are additionally
//! persisted through the [`repository::SessionRepository`].

pub mod filter;
pub mod repository;
pub mod router;

pub use filter::{evaluate_tag_query, validate_tag_query, TagExpr};
pub use repository::{InMemorySessionRepository, PersistedSession, SessionRepository};
pub use router::SessionRouter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ProxyError, ProxyResult};

/// Which downstream transport a session is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownstreamTransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl fmt::Display for DownstreamTransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        };
        f.write_str(name)
    }
}

/// The rule selecting which upstreams a session sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionFilter {
    /// Every upstream
    None,

    /// Any of the listed tags (OR)
    Tags { tags: Vec<String> },

    /// Boolean tag expression, kept in source form
    Expression { source: String },

    /// JSON tag-query DSL
    Query { query: Value },

    /// Saved filter resolved by name through a preset collaborator
    Preset { name: String },
}

impl SessionFilter {
    /// Evaluate this filter against an upstream's tag set. Preset filters
    /// must be resolved to a concrete filter first.
    pub fn matches(&self, tags: &[String]) -> ProxyResult<bool> {
        match self {
            SessionFilter::None => Ok(true),
            SessionFilter::Tags { tags: wanted } => {
                Ok(wanted.iter().any(|w| tags.iter().any(|have| have == w)))
            }
            SessionFilter::Expression { source } => Ok(TagExpr::parse(source)?.matches(tags)),
            SessionFilter::Query { query } => evaluate_tag_query(query, tags),
            SessionFilter::Preset { name } => Err(ProxyError::internal(format!(
                "preset '{}' must be resolved before matching",
                name
            ))),
        }
    }
}

/// Resolves preset names to concrete filters; the store itself lives outside
/// the core
#[async_trait]
pub trait PresetResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> ProxyResult<SessionFilter>;
}

/// Resolver for deployments without preset support
#[derive(Debug, Default, Clone)]
pub struct NoPresets;

#[async_trait]
impl PresetResolver for NoPresets {
    async fn resolve(&self, name: &str) -> ProxyResult<SessionFilter> {
        Err(ProxyError::not_found("preset", name))
    }
}

/// Client context attached to a session, forwarded to templating and, for
/// the stdio bridge, to the upstream URL as query parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_version: Option<String>,
}

impl SessionContext {
    /// Context as URL query pairs, omitting absent fields
    pub fn query_pairs(&self, session_id: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                pairs.push((key.to_string(), value.clone()));
            }
        };
        push("projectPath", &self.project_path);
        push("projectName", &self.project_name);
        push("environment", &self.environment);
        push("user", &self.user);
        push("runtimeVersion", &self.runtime_version);
        push("platform", &self.platform);
        push("clientName", &self.client_name);
        push("clientVersion", &self.client_version);
        push("proxyVersion", &self.proxy_version);
        if let Some(timestamp) = &self.timestamp {
            pairs.push(("timestamp".to_string(), timestamp.to_rfc3339()));
        }
        pairs.push(("sessionId".to_string(), session_id.to_string()));
        pairs
    }
}

/// Raw filter-related options extracted from an inbound request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterParams {
    /// Named preset; takes priority over everything else
    pub preset: Option<String>,

    /// Boolean tag expression source
    pub filter: Option<String>,

    /// JSON tag-query DSL
    pub tag_query: Option<Value>,

    /// Comma-separated tag list (OR)
    pub tags: Option<String>,

    /// Whether list results are paginated
    pub pagination: Option<bool>,

    /// Opaque template forwarded to the instruction collaborator
    pub template: Option<String>,
}

impl FilterParams {
    /// Resolve to a validated session filter.
    ///
    /// Priority when several are given: preset > filter > tagQuery > tags.
    pub fn resolve_filter(&self) -> ProxyResult<SessionFilter> {
        if let Some(name) = &self.preset {
            if name.trim().is_empty() {
                return Err(ProxyError::invalid_params("preset name cannot be empty"));
            }
            return Ok(SessionFilter::Preset { name: name.clone() });
        }
        if let Some(source) = &self.filter {
            TagExpr::parse(source)?;
            return Ok(SessionFilter::Expression {
                source: source.clone(),
            });
        }
        if let Some(query) = &self.tag_query {
            validate_tag_query(query)?;
            return Ok(SessionFilter::Query {
                query: query.clone(),
            });
        }
        if let Some(raw) = &self.tags {
            let tags: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            if tags.is_empty() {
                return Err(ProxyError::invalid_params("tag list cannot be empty"));
            }
            return Ok(SessionFilter::Tags { tags });
        }
        Ok(SessionFilter::None)
    }
}

/// One live downstream session
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub filter: SessionFilter,
    pub enable_pagination: bool,
    pub custom_template: Option<String>,
    pub context: Option<SessionContext>,
    pub transport: DownstreamTransportKind,
    pub created_at: DateTime<Utc>,

    initialized: AtomicBool,
    resource_index: SyncMutex<HashMap<String, String>>,
    outbound: SyncMutex<Option<tokio::sync::mpsc::UnboundedSender<crate::protocol::JsonRpcMessage>>>,
}

impl Session {
    /// Create a fresh session
    pub fn new(
        id: String,
        filter: SessionFilter,
        enable_pagination: bool,
        custom_template: Option<String>,
        context: Option<SessionContext>,
        transport: DownstreamTransportKind,
    ) -> Self {
        Self {
            id,
            filter,
            enable_pagination,
            custom_template,
            context,
            transport,
            created_at: Utc::now(),
            initialized: AtomicBool::new(false),
            resource_index: SyncMutex::new(HashMap::new()),
            outbound: SyncMutex::new(None),
        }
    }

    /// Rebuild a session from persisted state. Restored sessions count as
    /// already initialized so the MCP handshake is not replayed.
    pub fn from_persisted(id: String, state: PersistedSession) -> Self {
        Self {
            id,
            filter: state.filter,
            enable_pagination: state.enable_pagination,
            custom_template: state.custom_template,
            context: state.context,
            transport: state.transport_kind,
            created_at: state.created_at,
            initialized: AtomicBool::new(true),
            resource_index: SyncMutex::new(HashMap::new()),
            outbound: SyncMutex::new(None),
        }
    }

    /// Open the outbound stream for this session, replacing any previous
    /// one. Messages sent while no stream is attached are dropped by
    /// `send_outbound`.
    pub fn attach_outbound(
        &self,
    ) -> tokio::sync::mpsc::UnboundedReceiver<crate::protocol::JsonRpcMessage> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        rx
    }

    /// Push a message to the session's outbound stream; returns whether a
    /// live stream accepted it
    pub fn send_outbound(&self, message: crate::protocol::JsonRpcMessage) -> bool {
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Serialize for the repository
    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            filter: self.filter.clone(),
            enable_pagination: self.enable_pagination,
            custom_template: self.custom_template.clone(),
            context: self.context.clone(),
            transport_kind: self.transport,
            created_at: self.created_at,
            last_access: Utc::now(),
        }
    }

    /// Whether the MCP handshake has completed on this session
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Mark the handshake complete
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    /// Remember which server owns a resource URI
    pub fn index_resource(&self, uri: &str, server: &str) {
        self.resource_index
            .lock()
            .insert(uri.to_string(), server.to_string());
    }

    /// Resolve a resource URI to its owning server
    pub fn resolve_resource(&self, uri: &str) -> Option<String> {
        self.resource_index.lock().get(uri).cloned()
    }
}
