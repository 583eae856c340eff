//! Wolfpack - Distributed Cluster Membership and Replica Placement
//!
//! Node binary: loads the configuration, wires the membership core and
//! gossips until interrupted.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpack::config::WolfpackConfig;
use wolfpack::error::Result;
use wolfpack::node::ClusterNode;

/// Wolfpack - Distributed Cluster Membership and Replica Placement
#[derive(Parser)]
#[command(name = "wolfpack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfpack.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the wolfpack node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "wolfpack.toml")]
        output: PathBuf,

        /// Gossip bind address
        #[arg(long, default_value = "0.0.0.0:7946")]
        bind: String,
    },

    /// Validate a configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, bind } => run_init(output, bind),
        Commands::Validate => run_validate(cli.config),
    }
}

async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = WolfpackConfig::from_file(&config_path)?;
    init_logging(log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);

    let node = ClusterNode::new(config)?;
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    node.stop().await;
    Ok(())
}

fn run_init(output: PathBuf, bind: String) -> Result<()> {
    if output.exists() {
        return Err(wolfpack::Error::Config(format!(
            "{} already exists",
            output.display()
        )));
    }
    std::fs::write(&output, WolfpackConfig::example(&bind))?;
    println!("wrote {}", output.display());
    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    let config = WolfpackConfig::from_file(&config_path)?;
    println!(
        "configuration is valid: cluster {:?}, {} seed(s)",
        config.cluster.name,
        config.cluster.seeds.len()
    );
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
