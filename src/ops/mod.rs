//! Operator commands against a running coordinator

pub mod reshard;

pub use reshard::ReshardClient;
