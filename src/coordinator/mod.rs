//! Resharding coordinator
//!
//! The coordinator is responsible for:
//! - The durable operation record and catalog (`record`, `store`)
//! - Tracking participant progress (`observer`)
//! - Sequencing the phases of each operation (`machine`)
//! - Routing refresh notifications to shards (`notifier`)
//! - Hosting, resumption and cleanup of operations (`service`)

pub mod http;
pub mod machine;
pub mod notifier;
pub mod observer;
pub mod record;
pub mod server;
pub mod service;
pub mod store;

pub use machine::{CompletionOutcome, CoordinatorDeps, PhaseChangeEvent, ReshardingCoordinator};
pub use server::Coordinator;
pub use service::ReshardingService;
