//! Connect to an MCP server described by a JSON config file and print its
//! tool inventory.
//!
//! ```sh
//! cargo run --example list_tools -- server.json
//! ```

use anyhow::Context;
use toolbridge::{ServerConfig, Toolkit};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: list_tools <config.json>")?;
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
    let config = ServerConfig::from_value(serde_json::from_str(&raw)?)?;

    let toolkit = Toolkit::new(config);
    toolkit.initialize().await?;

    for tool in toolkit.tools() {
        println!("{}: {}", tool.name(), tool.description());
    }
    Ok(())
}
