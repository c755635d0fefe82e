//! Bitmessage Node -- P2P network client.
//!
//! Usage:
//!   bitmessage-node                      # Run with default config
//!   bitmessage-node --config path.toml   # Run with custom config
//!   bitmessage-node default-config       # Print the default config

use bitmessage_governor::Governor;
use bitmessage_node::config::NodeConfig;
use bitmessage_node::{bootstrap, expand_tilde, Client};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bitmessage-node", about = "Bitmessage P2P network client")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.bitmessage/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client (default)
    Run,
    /// Print the default configuration as TOML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bitmessage_node=info,bitmessage_protocol=info,bitmessage_governor=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::DefaultConfig) => {
            print!("{}", toml::to_string_pretty(&NodeConfig::default())?);
        }
        Some(Commands::Run) | None => {
            let config_path = expand_tilde(&cli.config);
            let cfg = NodeConfig::load_or_default(&config_path)?;
            run_node(cfg).await?;
        }
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let settings = cfg.client_settings()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %settings.listen_addr,
        max_outbound = settings.targets.max_outbound,
        max_inbound = settings.targets.max_inbound,
        user_agent = %settings.user_agent,
        "starting bitmessage-node"
    );

    let mut governor = Governor::new(settings.targets.clone());
    let seeded = bootstrap::bootstrap(&mut governor, settings.services).await;
    tracing::info!(peers = seeded, "registry seeded");

    let (client, handle) = Client::bind(settings, governor).await?;
    let client_task = tokio::spawn(client.run());

    tracing::info!("client running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    handle.shutdown().await?;
    client_task.await??;

    tracing::info!("shutdown complete");
    Ok(())
}
