//! # Manifold: an aggregating MCP proxy
//!
//! Manifold presents itself to downstream clients as a single MCP server
//! while fanning out to many upstream MCP servers, federating their tools,
//! resources, prompts, and instructions into one namespace.
//!
//! ## Architecture
//!
//! - [`upstream`] - connection manager: bounded-concurrency startup,
//!   exponential-backoff retries with transport recreation, OAuth parking,
//!   in-flight attempt deduplication
//! - [`cache`] - request-coalescing, size-bounded, TTL-aware cache of full
//!   tool schemas
//! - [`registry`] - lightweight tool metadata index with glob filtering and
//!   opaque cursor pagination
//! - [`aggregate`] - conflict-aware capability merging into the single set
//!   advertised downstream
//! - [`session`] - per-session tag filters, persistence, and request
//!   routing across the filtered upstream set
//! - [`server`] - axum handlers for the streamable HTTP and SSE transports
//!   plus the stdio bridge
//! - [`protocol`] - JSON-RPC 2.0 framing and MCP message types
//! - [`error`] - structured error taxonomy shared by every layer
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use manifold_mcp::cache::SchemaCache;
//! use manifold_mcp::server::{mcp_routes, ServerConfig};
//! use manifold_mcp::session::{InMemorySessionRepository, SessionRouter};
//! use manifold_mcp::upstream::UpstreamManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = manifold_config::ProxyConfig::default();
//!     let manager = UpstreamManager::with_defaults();
//!     manager.create_all(&config.upstreams).await;
//!
//!     let router = Arc::new(SessionRouter::new(
//!         Arc::clone(&manager),
//!         Arc::new(SchemaCache::default()),
//!         Arc::new(InMemorySessionRepository::new()),
//!         ServerConfig::default(),
//!     ));
//!     router.refresh_registry().await.ok();
//!     router.spawn_notification_forwarders();
//!
//!     let app = axum::Router::new()
//!         .merge(mcp_routes())
//!         .with_state(Arc::clone(&router));
//!     let listener = tokio::net::TcpListener::bind(router.config().bind_address())
//!         .await
//!         .unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod aggregate;
pub mod cache;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod upstream;

// Re-export commonly used types
pub use error::{ProxyError, ProxyResult};

pub use aggregate::{AggregatedCapabilities, CapabilityAggregator};
pub use cache::{CacheStats, SchemaCache, SchemaCacheConfig};
pub use protocol::{
    CapabilitySet, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ServerInfo,
    ToolDefinition, MCP_PROTOCOL_VERSION,
};
pub use registry::{ToolMetadata, ToolNameFormatter, ToolQuery, ToolRegistry};
pub use server::{mcp_routes, InstructionRenderer, ServerConfig, StdioBridge};
pub use session::{
    DownstreamTransportKind, FilterParams, InMemorySessionRepository, PresetResolver, Session,
    SessionContext, SessionFilter, SessionRepository, SessionRouter,
};
pub use upstream::{
    ConnectPolicy, DefaultTransportFactory, ManagerConfig, TransportFactory, UpstreamClient,
    UpstreamManager, UpstreamRecord, UpstreamStatus,
};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::error::{ProxyError, ProxyResult};
    pub use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
    pub use crate::server::ServerConfig;
    pub use crate::session::{FilterParams, SessionFilter, SessionRouter};
    pub use crate::upstream::{UpstreamManager, UpstreamStatus};

    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
}
