//! MCP protocol implementation: JSON-RPC 2.0 framing, message types, and
//! capability sets

pub mod capabilities;
pub mod jsonrpc;
pub mod messages;

pub use capabilities::{CapabilityConflict, CapabilitySet, Category, NOTIFICATION_KEYS};
pub use jsonrpc::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
};
pub use messages::{
    methods, notifications, CallToolParams, CallToolResult, GetPromptParams, GetPromptResult,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PromptDescriptor, ReadResourceResult, ResourceDescriptor, ResourceParams, ServerInfo,
    ToolContent, ToolDefinition, MCP_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
