//! Channel establishment: stdio spawning and remote transport negotiation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use toolbridge_jsonrpc as jsonrpc;

use crate::config::{RemoteServerConfig, ServerConfig, StdioServerConfig};
use crate::security::{self, TrustMode};
use crate::session::{Session, DEFAULT_REQUEST_TIMEOUT};

/// Seam for opening an initialized session from a server configuration.
///
/// Production code uses [`Connector`]; tests substitute in-memory channels.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> anyhow::Result<Session>;
}

#[derive(Debug, Clone)]
pub struct Connector {
    client_name: String,
    client_version: String,
    trust_mode: TrustMode,
    request_timeout: Duration,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

impl Connector {
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            client_version: client_version.into(),
            trust_mode: TrustMode::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_trust_mode(mut self, trust_mode: TrustMode) -> Self {
        self.trust_mode = trust_mode;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn session(&self, client: jsonrpc::Client) -> Session {
        Session::new(client, &self.client_name, &self.client_version)
            .with_timeout(self.request_timeout)
    }

    async fn connect_stdio(&self, config: &StdioServerConfig) -> anyhow::Result<Session> {
        if self.trust_mode == TrustMode::Untrusted {
            security::validate_stdio_config(config)
                .with_context(|| format!("refusing to spawn '{}'", config.command))?;
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.env_clear();
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        // Spawned servers still need to find system executables even when the
        // caller supplied a partial environment; the host search path wins.
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        let client = jsonrpc::Client::spawn_command(cmd)
            .await
            .with_context(|| format!("spawn mcp server: {}", config.command))?;
        tracing::debug!(
            command = %config.command,
            pid = ?client.child_id(),
            "spawned stdio mcp server"
        );

        let mut session = self.session(client);
        if let Err(err) = session.initialize().await {
            let _ = session.close().await;
            return Err(err.context("initialize stdio mcp server"));
        }
        Ok(session)
    }

    async fn try_streamable_http(
        &self,
        config: &RemoteServerConfig,
        options: &jsonrpc::HttpOptions,
    ) -> anyhow::Result<Session> {
        let client = jsonrpc::Client::connect_streamable_http(&config.url, options.clone())
            .context("build streamable http channel")?;
        let mut session = self.session(client);
        if let Err(err) = session.initialize().await {
            let _ = session.close().await;
            return Err(err.context("initialize over streamable http"));
        }
        Ok(session)
    }

    async fn try_sse(
        &self,
        config: &RemoteServerConfig,
        options: &jsonrpc::HttpOptions,
    ) -> anyhow::Result<Session> {
        let client = jsonrpc::Client::connect_sse(&config.url, options.clone())
            .await
            .context("connect sse channel")?;
        let mut session = self.session(client);
        if let Err(err) = session.initialize().await {
            let _ = session.close().await;
            return Err(err.context("initialize over sse"));
        }
        Ok(session)
    }

    /// Two explicit attempts: streamable HTTP first, legacy SSE second.
    ///
    /// The caller's headers ride on every request of both attempts because
    /// they are installed as default headers on the HTTP client.
    async fn connect_remote(&self, config: &RemoteServerConfig) -> anyhow::Result<Session> {
        if config.url.trim().is_empty() {
            anyhow::bail!("url is required for remote transport");
        }

        let options = jsonrpc::HttpOptions {
            headers: config
                .headers
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            connect_timeout: Some(self.request_timeout),
            request_timeout: Some(self.request_timeout),
        };

        match self.try_streamable_http(config, &options).await {
            Ok(session) => Ok(session),
            Err(err) => {
                tracing::warn!(
                    url = %config.url,
                    error = %err,
                    "streamable http connection failed; falling back to sse"
                );
                self.try_sse(config, &options)
                    .await
                    .context("connect remote mcp server over sse")
            }
        }
    }
}

#[async_trait]
impl Connect for Connector {
    async fn connect(&self, config: &ServerConfig) -> anyhow::Result<Session> {
        match config {
            ServerConfig::Stdio(stdio) => self.connect_stdio(stdio).await,
            ServerConfig::Remote(remote) => self.connect_remote(remote).await,
        }
    }
}
