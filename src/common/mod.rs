//! Common utilities and types shared across minishard

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Config, CoordinatorConfig, RetryConfig};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{parse_duration, retry_with_backoff, timestamp_now, timestamp_now_millis, RetryScope};
