//! CLI for resharding operations

use clap::{Parser, Subcommand};
use minishard::coordinator::http::StartReshardRequest;
use minishard::coordinator::record::{
    OperationId, ParticipantDescriptor, PartitionAssignment, ReshardRequest,
};
use minishard::coordinator::CompletionOutcome;
use minishard::ops::ReshardClient;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "minishard")]
#[command(about = "minishard resharding CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:7000")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start resharding a collection
    Start {
        /// Namespace as <db>.<collection>
        namespace: String,

        /// New shard key fields (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        key: Vec<String>,

        /// Donor shards (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        donors: Vec<String>,

        /// Recipient shards (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        recipients: Vec<String>,

        /// Partition assignment as a JSON file
        #[arg(long)]
        assignment: Option<PathBuf>,
    },

    /// Supply the partition assignment of a started operation
    Assign {
        id: OperationId,

        /// JSON file with chunks and zones
        #[arg(long)]
        file: PathBuf,
    },

    /// Send a participant state report (JSON file)
    Report {
        id: OperationId,

        #[arg(long)]
        file: PathBuf,
    },

    /// Show one operation, or all of them
    Status { id: Option<OperationId> },

    /// Abort an operation that has not committed
    Abort {
        id: OperationId,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Block until an operation finishes
    Wait { id: OperationId },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = ReshardClient::new(&cli.coordinator)?;

    match cli.command {
        Commands::Start {
            namespace,
            key,
            donors,
            recipients,
            assignment,
        } => {
            let assignment = match assignment {
                Some(path) => Some(read_json::<PartitionAssignment>(&path)?),
                None => None,
            };
            let record = client
                .start(&StartReshardRequest {
                    request: ReshardRequest {
                        namespace,
                        new_shard_key: key,
                        donors,
                        recipients,
                    },
                    assignment,
                })
                .await?;
            println!("Started resharding {}", record.original_namespace);
            println!("  Operation: {}", record.operation_id);
            println!("  Temporary namespace: {}", record.temporary_namespace);
        }

        Commands::Assign { id, file } => {
            let assignment: PartitionAssignment = read_json(&file)?;
            client.set_assignment(&id, &assignment).await?;
            println!("Assignment accepted ({} chunks)", assignment.chunks.len());
        }

        Commands::Report { id, file } => {
            let descriptor: ParticipantDescriptor = read_json(&file)?;
            client.report(&id, &descriptor).await?;
            println!("Report from {} accepted", descriptor.shard_id());
        }

        Commands::Status { id: Some(id) } => {
            let status = client.status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Status { id: None } => {
            for record in client.list().await? {
                println!(
                    "{}  {:<20} {}",
                    record.operation_id,
                    record.phase.as_str(),
                    record.original_namespace
                );
            }
        }

        Commands::Abort { id, reason } => {
            client.abort(&id, reason).await?;
            println!("Abort requested for {}", id);
        }

        Commands::Wait { id } => match client.wait(&id).await? {
            CompletionOutcome::Succeeded => println!("Resharding {} succeeded", id),
            CompletionOutcome::Failed { reason } => {
                anyhow::bail!("resharding {} failed: {}", id, reason)
            }
        },
    }

    Ok(())
}
