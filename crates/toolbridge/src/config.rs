use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A server configuration with the transport decided once, at the boundary.
///
/// An object carrying `command` is a local stdio server; an object carrying
/// `url` is a remote server. Nothing downstream re-inspects raw JSON to work
/// out how to connect.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServerConfig {
    Stdio(StdioServerConfig),
    Remote(RemoteServerConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StdioServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteServerConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServerConfig {
    /// Parse an untrusted JSON value into a typed configuration.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        serde_json::from_value(value).context("parse server configuration")
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            ServerConfig::Stdio(_) => "stdio",
            ServerConfig::Remote(_) => "sse",
        }
    }
}
