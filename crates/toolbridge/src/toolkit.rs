//! Lazy tool discovery and per-call tool handles.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;

use crate::config::ServerConfig;
use crate::mcp::{CallToolResult, Tool, ToolInputSchema};
use crate::session::Session;
use crate::transport::{Connect, Connector};

/// What the toolkit and its handles share: one configuration, one connector.
struct Opener {
    config: ServerConfig,
    connector: Arc<dyn Connect>,
}

impl Opener {
    async fn connect(&self) -> anyhow::Result<Session> {
        self.connector.connect(&self.config).await
    }
}

/// A lazily initializing view of one MCP server's tool inventory.
pub struct Toolkit {
    opener: Arc<Opener>,
    tools: OnceCell<Vec<ToolHandle>>,
}

impl Toolkit {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_connector(config, Arc::new(Connector::default()))
    }

    pub fn with_connector(config: ServerConfig, connector: Arc<dyn Connect>) -> Self {
        Self {
            opener: Arc::new(Opener { config, connector }),
            tools: OnceCell::new(),
        }
    }

    /// Discover the server's tools once and build one handle per tool.
    ///
    /// Idempotent: concurrent and repeated calls share a single discovery.
    /// A failed attempt caches nothing; the next call starts over.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.tools
            .get_or_try_init(|| discover(self.opener.clone()))
            .await?;
        Ok(())
    }

    /// The discovered handles; empty before `initialize` has succeeded.
    pub fn tools(&self) -> &[ToolHandle] {
        self.tools.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Open a fresh initialized session for direct protocol access.
    pub async fn create_session(&self) -> anyhow::Result<Session> {
        self.opener.connect().await
    }
}

async fn discover(opener: Arc<Opener>) -> anyhow::Result<Vec<ToolHandle>> {
    let mut session = opener.connect().await.context("connect for tool discovery")?;
    let listed = session.list_tools().await;
    let closed = session.close().await;
    let listed = listed.context("list tools")?;
    closed.context("close discovery channel")?;

    Ok(listed
        .tools
        .into_iter()
        .map(|tool| ToolHandle::new(tool, opener.clone()))
        .collect())
}

/// A locally callable handle to one remote tool.
#[derive(Clone)]
pub struct ToolHandle {
    name: String,
    description: String,
    args_schema: Value,
    opener: Arc<Opener>,
}

impl ToolHandle {
    fn new(tool: Tool, opener: Arc<Opener>) -> Self {
        let args_schema = permissive_args_schema(&tool.input_schema);
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            args_schema,
            opener,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn args_schema(&self) -> &Value {
        &self.args_schema
    }

    /// Invoke the tool over a fresh channel.
    ///
    /// The channel exists for this call only and is closed whether the call
    /// succeeds or fails, so one stuck invocation cannot wedge a shared
    /// connection.
    pub async fn call(&self, arguments: Value) -> anyhow::Result<String> {
        let mut session = self
            .opener
            .connect()
            .await
            .with_context(|| format!("connect for tool call: {}", self.name))?;
        let result = session.call_tool(&self.name, Some(arguments)).await;
        if let Err(err) = session.close().await {
            tracing::debug!(tool = %self.name, error = %err, "closing tool call channel failed");
        }
        let result = result.with_context(|| format!("call tool: {}", self.name))?;

        let rendered = render_content(&result);
        if result.is_error.unwrap_or(false) {
            anyhow::bail!("tool '{}' reported an error: {rendered}", self.name);
        }
        Ok(rendered)
    }
}

/// Keep the property names and cardinality of the server's input schema,
/// but accept anything per property; servers are the source of truth for
/// argument validation.
fn permissive_args_schema(input_schema: &ToolInputSchema) -> Value {
    let mut properties = Map::new();
    if let Some(declared) = input_schema.properties.as_ref().and_then(Value::as_object) {
        for key in declared.keys() {
            properties.insert(key.clone(), json!({}));
        }
    }
    json!({ "type": "object", "properties": properties })
}

/// Text-only content joins the text blocks; anything else is serialized.
fn render_content(result: &CallToolResult) -> String {
    let mut texts = Vec::with_capacity(result.content.len());
    for part in &result.content {
        match (
            part.get("type").and_then(Value::as_str),
            part.get("text").and_then(Value::as_str),
        ) {
            (Some("text"), Some(text)) => texts.push(text),
            _ => return serde_json::to_string(&result.content).unwrap_or_default(),
        }
    }
    texts.join("\n")
}
