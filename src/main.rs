//! dvpn - decentralized VPN client bridge
//!
//! Command-line front end for a locally running engine: connect, disconnect,
//! inspect status and browse nodes.

use clap::{Parser, Subcommand};
use dvpn_core::{error::DvpnError, init_logging, types::ServiceType};

mod cli;

#[derive(Parser)]
#[command(name = "dvpn")]
#[command(version, about = "Client bridge for a decentralized VPN engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file
    Init {
        /// Engine control API address
        #[arg(long)]
        address: Option<String>,
        /// Consumer identity used for connects
        #[arg(long)]
        identity: Option<String>,
        /// Service requested when connecting (wireguard, openvpn)
        #[arg(long)]
        service: Option<ServiceType>,
        /// Overwrite an existing configuration without asking
        #[arg(long)]
        force: bool,
    },
    /// Show the effective configuration
    Config,
    /// Connect and stay attached until Ctrl+C
    Connect {
        /// Node to connect to; any node when omitted
        #[arg(long)]
        node: Option<String>,
        /// Reuse the node of the last successful connection
        #[arg(long, conflicts_with = "node")]
        last: bool,
        /// Override the configured service type
        #[arg(long)]
        service: Option<ServiceType>,
    },
    /// Tear down the engine's tunnel
    Disconnect,
    /// Show engine health and connection status
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// List nodes offering a service
    Nodes {
        #[arg(long)]
        service: Option<ServiceType>,
        /// Two-letter country code filter
        #[arg(long)]
        country: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init {
            address,
            identity,
            service,
            force,
        } => cli::setup::run_init(address, identity, service, force),
        Commands::Config => cli::setup::run_config(),
        Commands::Connect { node, last, service } => cli::vpn::run_connect(node, last, service).await,
        Commands::Disconnect => cli::vpn::run_disconnect().await,
        Commands::Status { json } => cli::vpn::run_status(json).await,
        Commands::Nodes { service, country } => cli::vpn::run_nodes(service, country).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match e {
                // Configuration and local state problems (exit code 2)
                DvpnError::Config(_) | DvpnError::Toml(_) | DvpnError::TomlSerialize(_) => 2,
                DvpnError::Store(_) => 2,
                // Engine and session failures (exit code 1 - runtime)
                DvpnError::Engine(_) | DvpnError::Session(_) => 1,
                DvpnError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}
