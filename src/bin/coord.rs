//! Coordinator binary

use clap::{Parser, Subcommand};
use minishard::common::Config;
use minishard::Coordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minishard-coord")]
#[command(about = "minishard resharding coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Catalog directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Shard endpoints as id=url (repeatable or comma-separated)
        #[arg(long = "shard", value_delimiter = ',')]
        shards: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            db,
            shards,
        } => {
            // CLI flags override the file and environment
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind;
            }
            if let Some(db) = db {
                config.coordinator.db_path = db;
            }
            for entry in shards {
                let (shard, url) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("expected id=url, got {:?}", entry))?;
                config
                    .coordinator
                    .shard_urls
                    .insert(shard.to_string(), url.to_string());
            }

            let coord = Coordinator::new(config.coordinator, config.node_id);
            coord.serve().await?;
        }
    }

    Ok(())
}
