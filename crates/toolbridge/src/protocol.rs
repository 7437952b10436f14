use serde::de::DeserializeOwned;
use serde::Serialize;

/// MCP protocol version sent during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Typed MCP request (method + params + result).
pub trait McpRequest {
    const METHOD: &'static str;
    type Params: Serialize;
    type Result: DeserializeOwned;
}

/// Typed MCP notification (method + params).
pub trait McpNotification {
    const METHOD: &'static str;
    type Params: Serialize;
}
