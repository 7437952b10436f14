//! `toolbridge` connects a host application to MCP tool servers and exposes
//! each remote tool as a locally callable handle.
//!
//! It provides:
//! - `security`: screening for untrusted server configurations (command
//!   allow-list, flag deny-lists, injection and file-access checks).
//! - `ServerConfig`: the transport decision, made once at the boundary.
//! - `Connector`: channel establishment — stdio spawning for local commands,
//!   streamable HTTP with legacy-SSE fallback for remote URLs.
//! - `Session`: one initialized MCP conversation (handshake, `tools/list`,
//!   `tools/call`).
//! - `Toolkit` / `ToolHandle`: lazy one-shot tool discovery plus per-call
//!   handles that open and close a fresh channel for every invocation.
//!
//! ## Safe by default
//!
//! Configurations are treated as untrusted: stdio configs are validated
//! before anything is spawned. Deployments that fully trust their
//! configuration source opt out with `TrustMode::Trusted`.
//!
//! ## Non-goals
//!
//! - Implementing an MCP server
//! - Approval/sandbox policy engines
//! - Automatic reconnect or connection pooling

mod config;
pub mod mcp;
mod protocol;
pub mod security;
mod session;
mod toolkit;
mod transport;

pub use config::{RemoteServerConfig, ServerConfig, StdioServerConfig};
pub use protocol::{McpNotification, McpRequest, MCP_PROTOCOL_VERSION};
pub use security::{validate_server_config, SecurityError, TrustMode};
pub use session::{Session, DEFAULT_REQUEST_TIMEOUT};
pub use toolkit::{ToolHandle, Toolkit};
pub use transport::{Connect, Connector};
