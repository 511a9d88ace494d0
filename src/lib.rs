//! # minishard
//!
//! A coordinator that changes the shard key of a sharded collection while
//! it stays online:
//! - Durable operation record, resumed after failover
//! - Participant progress tracking with memoized gates
//! - Atomic catalog commit of the new routing
//! - HTTP API with SSE phase events and Prometheus metrics
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │           Resharding Coordinator          │
//! │   record + catalog (RocksDB, one batch    │
//! │   per phase transition)                   │
//! └──────┬──────────────────────────▲─────────┘
//!        │ flush routing table       │ state reports
//!   ┌────┴──────────┬────────────────┴──┐
//!   │               │                   │
//! ┌─▼──────────┐ ┌──▼─────────┐ ┌───────▼────┐
//! │ Donor A    │ │ Donor B    │ │ Recipient C │
//! └────────────┘ └────────────┘ └─────────────┘
//! ```
//!
//! Phases: `unused → initializing → initialized → preparing-to-donate →
//! cloning → mirroring → committed → dropping → done`, or `error`.
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! minishard-coord serve \
//!   --id coord-1 \
//!   --bind 0.0.0.0:7000 \
//!   --db ./minishard-data \
//!   --shard shard-a=http://10.0.0.1:8000,shard-b=http://10.0.0.2:8000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Start resharding app.users on (tenant, id)
//! minishard start app.users --key tenant,id \
//!   --donors shard-a --recipients shard-b,shard-c --assignment ./ranges.json
//!
//! # Inspect and wait
//! minishard status <operation-id>
//! minishard wait <operation-id>
//!
//! # Abort before commit
//! minishard abort <operation-id> --reason "maintenance window over"
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, ReshardingCoordinator, ReshardingService};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
