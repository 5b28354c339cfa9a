//! Configuration model for the Manifold MCP proxy
//!
//! This crate defines the upstream configuration map (transport selector,
//! tags, timeouts, disabled flag), validation, and the change-event surface
//! used for incremental reconfiguration. File loading and watching belong to
//! an outer layer; this crate only parses and validates.

pub mod error;
pub mod events;
pub mod upstream;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use events::{plan_action, ChangeAction, ChangedField, ConfigChange};
pub use upstream::{
    OauthConfig, ProxyConfig, UpstreamConfig, UpstreamTransportConfig,
};
