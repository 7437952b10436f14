use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use toolbridge::{Connector, ServerConfig, Toolkit, TrustMode};

#[derive(Parser)]
#[command(name = "toolctl", about = "Inspect and call MCP tool servers", version)]
struct Cli {
    /// Path to a JSON server configuration file.
    #[arg(long)]
    config: PathBuf,
    /// Trust the configuration and skip security validation.
    #[arg(long)]
    trust: bool,
    /// Confirm --trust non-interactively.
    #[arg(long)]
    yes_trust: bool,
    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the security validator against the configuration.
    Validate,
    /// Connect and print the discovered tool inventory as JSON.
    ListTools,
    /// Invoke a single tool and print its rendered result.
    Call {
        #[arg(long)]
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("read config file: {}", cli.config.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", cli.config.display()))?;

    match cli.command {
        Command::Validate => {
            toolbridge::validate_server_config(&value).context("configuration rejected")?;
            println!("ok");
            Ok(())
        }
        Command::ListTools => {
            let toolkit = build_toolkit(value, &cli)?;
            toolkit.initialize().await?;
            let tools: Vec<serde_json::Value> = toolkit
                .tools()
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "name": tool.name(),
                        "description": tool.description(),
                        "argsSchema": tool.args_schema(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::Value::Array(tools))?
            );
            Ok(())
        }
        Command::Call { ref tool, ref args } => {
            let arguments = match args {
                Some(raw) => serde_json::from_str(raw).context("parse --args json")?,
                None => serde_json::json!({}),
            };
            let toolkit = build_toolkit(value, &cli)?;
            toolkit.initialize().await?;
            let handle = toolkit
                .tools()
                .iter()
                .find(|handle| handle.name() == tool)
                .with_context(|| format!("tool not found: {tool}"))?;
            let output = handle.call(arguments).await?;
            println!("{output}");
            Ok(())
        }
    }
}

fn build_toolkit(value: serde_json::Value, cli: &Cli) -> anyhow::Result<Toolkit> {
    let config = ServerConfig::from_value(value)?;

    let trust_mode = if cli.trust {
        if !cli.yes_trust {
            anyhow::bail!("--trust requires --yes-trust to confirm skipping validation");
        }
        eprintln!("warning: security validation disabled for this configuration");
        TrustMode::Trusted
    } else {
        TrustMode::Untrusted
    };

    let mut connector =
        Connector::new("toolctl", env!("CARGO_PKG_VERSION")).with_trust_mode(trust_mode);
    if let Some(secs) = cli.timeout_secs {
        connector = connector.with_request_timeout(Duration::from_secs(secs));
    }
    Ok(Toolkit::with_connector(config, Arc::new(connector)))
}
