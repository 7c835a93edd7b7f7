mod api;
mod client;
mod commands;
mod config;
mod domain;
mod exec;
mod platform;
mod runtime;
mod telemetry;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{CliOverrides, ConfigSource};
use crate::domain::types::NodeRole;

#[derive(Parser)]
#[command(
    name = "edge-agent",
    version,
    about = "Keeps edge-proxy config in sync, reports node health and ships logs"
)]
struct Cli {
    /// Config file (default: /etc/edge-agent/edge-agent.yaml, ./edge-agent.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Node ID reported to the control plane
    #[arg(short = 'i', long, global = true)]
    node_id: Option<String>,

    /// Node role (gateway or server)
    #[arg(short = 't', long, global = true)]
    node_role: Option<NodeRole>,

    /// Control plane base URL
    #[arg(long, global = true)]
    control_url: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default)
    Run,

    /// Show the running version
    Version {
        /// Also ask the control plane for the latest version
        #[arg(long)]
        check: bool,
    },

    /// Install a release now and restart the service
    Update {
        /// Version to install (default: latest published)
        #[arg(long)]
        target: Option<String>,

        /// Reinstall even if that version is already running
        #[arg(long)]
        force: bool,
    },

    /// Show or edit configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },

    /// Gateway config reconciliation
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List every key with its source
    Show,
    /// Print one key, or every key of a section
    Get { key: String },
    /// Persist a value to the config file
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum GatewayCommands {
    /// Fast-forward the proxy config checkout
    Pull,
    /// Validate and reload the proxy
    Reload,
    /// Show local vs. remote config revision
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        node_id: cli.node_id,
        node_role: cli.node_role,
        control_url: cli.control_url,
        verbose: cli.verbose,
    };
    let source = ConfigSource::new(cli.config, overrides);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::daemon::run(source),
        Commands::Version { check } => commands::version::run(source, check),
        Commands::Update { target, force } => commands::update::run(source, target, force),
        Commands::Config { command } => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => commands::config::show(&source),
            ConfigCommands::Get { key } => commands::config::get(&source, &key),
            ConfigCommands::Set { key, value } => commands::config::set(&source, &key, &value),
        },
        Commands::Gateway { command } => match command {
            GatewayCommands::Pull => commands::gateway::pull(&source),
            GatewayCommands::Reload => commands::gateway::reload(&source),
            GatewayCommands::Status => commands::gateway::status(&source),
        },
    }
}
