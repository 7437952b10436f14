use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use toolbridge_jsonrpc as jsonrpc;

use crate::mcp::{
    CallToolRequest, CallToolRequestParams, CallToolResult, InitializedNotification,
    ListToolsRequest, ListToolsResult,
};
use crate::protocol::{McpNotification, McpRequest, MCP_PROTOCOL_VERSION};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One MCP conversation over an established channel.
///
/// The session is not connected to anything abstract: it owns the channel,
/// and closing the session closes the channel.
pub struct Session {
    client: jsonrpc::Client,
    client_name: String,
    client_version: String,
    initialize_result: Option<Value>,
    request_timeout: Duration,
}

impl Session {
    pub fn new(
        client: jsonrpc::Client,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            client,
            client_name: client_name.into(),
            client_version: client_version.into(),
            initialize_result: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The server's `initialize` result, once the handshake has run.
    pub fn initialize_result(&self) -> Option<&Value> {
        self.initialize_result.as_ref()
    }

    /// Run the MCP handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&mut self) -> anyhow::Result<Value> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.client_name,
                "version": self.client_version,
            },
        });
        let result = self.request("initialize", Some(params)).await?;
        self.initialize_result = Some(result.clone());
        self.notify_typed::<InitializedNotification>(None).await?;
        Ok(result)
    }

    pub async fn request(&mut self, method: &str, params: Option<Value>) -> anyhow::Result<Value> {
        let params = params.unwrap_or(Value::Null);
        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.client.request(method, params),
        )
        .await;
        outcome
            .with_context(|| format!("mcp request timed out: {method}"))?
            .with_context(|| format!("mcp request failed: {method}"))
    }

    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> anyhow::Result<()> {
        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.client.notify(method, params),
        )
        .await;
        outcome
            .with_context(|| format!("mcp notification timed out: {method}"))?
            .with_context(|| format!("mcp notification failed: {method}"))
    }

    pub async fn request_typed<R: McpRequest>(
        &mut self,
        params: Option<R::Params>,
    ) -> anyhow::Result<R::Result> {
        let params = match params {
            Some(params) => Some(serde_json::to_value(params).context("serialize MCP params")?),
            None => None,
        };
        let result = self.request(R::METHOD, params).await?;
        serde_json::from_value(result).context("deserialize MCP result")
    }

    pub async fn notify_typed<N: McpNotification>(
        &mut self,
        params: Option<N::Params>,
    ) -> anyhow::Result<()> {
        let params = match params {
            Some(params) => Some(serde_json::to_value(params).context("serialize MCP params")?),
            None => None,
        };
        self.notify(N::METHOD, params).await
    }

    pub async fn list_tools(&mut self) -> anyhow::Result<ListToolsResult> {
        self.request_typed::<ListToolsRequest>(None).await
    }

    pub async fn call_tool(
        &mut self,
        tool: &str,
        arguments: Option<Value>,
    ) -> anyhow::Result<CallToolResult> {
        self.request_typed::<CallToolRequest>(Some(CallToolRequestParams {
            name: tool.to_string(),
            arguments,
        }))
        .await
    }

    /// Close the underlying channel.
    pub async fn close(self) -> anyhow::Result<()> {
        self.client.close().await.context("close mcp channel")
    }
}
