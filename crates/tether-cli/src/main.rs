//! Tether CLI: list and call MCP server tools from synchronous code.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tether_config::CliOverrides;
use tether_mcp::{ClientConfig, McpClient, ToolCatalog};

#[derive(Parser)]
#[command(name = "tether", version, about = "Call MCP server tools")]
struct Cli {
    /// Use this config file instead of the global and project files
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable MCP regardless of the configured setting
    #[arg(long, global = true)]
    enable: bool,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured servers
    Servers,

    /// Connect to a server and list its tools
    Tools {
        /// Server name from the config
        server: String,
    },

    /// Call a tool and print its text output
    Call {
        /// Server name from the config
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Give up on the call after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = tether_config::load(CliOverrides {
        config_file: cli.config,
        enabled: cli.enable.then_some(true),
    })
    .context("Failed to load configuration")?;

    match cli.command {
        Command::Servers => {
            print_servers(&config);
            Ok(())
        }
        Command::Tools { server } => {
            let mut client = McpClient::new(config)?;
            let (tools, _session) = client
                .connect(&server)
                .with_context(|| format!("Failed to connect to '{server}'"))?;
            print_tools(&tools);
            client.disconnect()?;
            Ok(())
        }
        Command::Call {
            server,
            tool,
            args,
            timeout_ms,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }
            let mut client = McpClient::new(config)?;
            let (tools, _session) = client
                .connect(&server)
                .with_context(|| format!("Failed to connect to '{server}'"))?;
            if tools.get(&tool).is_none() {
                tracing::warn!("Server '{server}' did not list a tool named '{tool}'");
            }
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .or(client.config().timeouts.call());
            let output = client
                .call_tool_with_timeout(&tool, arguments, timeout)
                .with_context(|| format!("Tool '{tool}' failed"))?;
            println!("{output}");
            client.disconnect()?;
            Ok(())
        }
    }
}

fn print_servers(config: &ClientConfig) {
    if !config.enabled {
        eprintln!("MCP is disabled (set [mcp] enabled = true or pass --enable)");
    }
    if config.servers.is_empty() {
        println!("No MCP servers configured.");
        return;
    }
    for server in &config.servers {
        println!("{}\t{} {}", server.name, server.command, server.args.join(" "));
    }
}

fn print_tools(tools: &ToolCatalog) {
    for tool in tools {
        match &tool.description {
            Some(desc) => println!("{}\t{}", tool.name, desc),
            None => println!("{}", tool.name),
        }
    }
}
