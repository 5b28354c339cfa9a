//! Inbound server surface: configuration, HTTP handlers, instruction
//! rendering, and the stdio bridge

pub mod config;
pub mod handler;
pub mod instructions;
pub mod stdio_bridge;

pub use config::ServerConfig;
pub use handler::{mcp_routes, mcp_routes_with_cors, McpQueryParams, MCP_SESSION_ID_HEADER};
pub use instructions::{InstructionRenderer, PassthroughInstructions};
pub use stdio_bridge::StdioBridge;
