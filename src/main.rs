use clap::{Parser, Subcommand};
use mcplink::config::McpConfig;
use mcplink::manager::{ConnectionStatus, McpClientManager};
use mcplink::tools::render_call_result;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcplink")]
#[command(about = "Connect to configured MCP servers and exercise their tools")]
#[command(
    long_about = "mcplink is a diagnostic front end for the MCP client runtime. It reads a \
TOML document listing MCP servers ([[mcp_servers]] tables with a transport, a command or a \
base_url, and optional headers/env), connects to each of them, and either lists the \
namespaced tools or performs a single tool call.\n\n\
Set RUST_LOG=mcplink=debug to watch the protocol exchange on stderr."
)]
struct Args {
    /// Path to the server configuration document.
    #[arg(short, long, default_value = "mcplink.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Connect every configured server and list the namespaced tools.
    List,
    /// Call one namespaced tool (e.g. `alpha__echo`) with JSON arguments.
    Call {
        tool: String,
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn status_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Disconnected => "disconnected",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Ready => "ready",
        ConnectionStatus::Failed => "failed",
        ConnectionStatus::Closed => "closed",
    }
}

async fn run_list(manager: &McpClientManager) -> ExitCode {
    for state in manager.server_states().await {
        match &state.last_error {
            Some(error) => println!(
                "{} [{}]: {}",
                state.display_name,
                status_label(state.status),
                error
            ),
            None => println!(
                "{} [{}]: {} tool(s)",
                state.display_name,
                status_label(state.status),
                state.tool_count
            ),
        }
    }
    for tool in manager.list_tools().await {
        match &tool.description {
            Some(description) => println!("  {} - {}", tool.local_name, description),
            None => println!("  {}", tool.local_name),
        }
    }
    ExitCode::SUCCESS
}

async fn run_call(manager: &McpClientManager, tool: &str, args: &str) -> ExitCode {
    let arguments: Map<String, Value> = match serde_json::from_str(args) {
        Ok(arguments) => arguments,
        Err(err) => {
            eprintln!("mcplink: --args must be a JSON object: {err}");
            return ExitCode::FAILURE;
        }
    };

    match manager.call_tool(tool, Some(arguments)).await {
        Ok(result) => {
            let rendered = render_call_result(&result);
            println!("{}", rendered.output);
            if rendered.is_error {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("mcplink: {err}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match McpConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mcplink: {err}");
            return ExitCode::FAILURE;
        }
    };

    let manager = McpClientManager::from_config(&config);
    manager.connect_all().await;

    let exit = match &args.command {
        CliCommand::List => run_list(&manager).await,
        CliCommand::Call { tool, args } => run_call(&manager, tool, args).await,
    };

    manager.disconnect_all().await;
    exit
}
