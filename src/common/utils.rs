//! Utility functions for minishard

use crate::common::config::RetryConfig;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        "d" => std::time::Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which failures a retry loop keeps going on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// Only errors classified as transient
    Transient,
    /// Everything: used where giving up would leave the operation unobservable
    Always,
}

/// Retry with exponential backoff until success, a non-retryable error, or cancellation.
///
/// The delay doubles from `policy.initial_delay()` up to `policy.max_delay()` with
/// a little jitter. There is no attempt limit: the loop is bounded by `cancel`.
pub async fn retry_with_backoff<F, T>(
    what: &str,
    policy: RetryConfig,
    scope: RetryScope,
    cancel: &CancellationToken,
    mut f: F,
) -> crate::Result<T>
where
    F: FnMut() -> crate::Result<T>,
{
    let mut delay = policy.initial_delay();
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(crate::Error::Cancelled);
        }
        attempt += 1;

        match f() {
            Ok(result) => return Ok(result),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if scope == RetryScope::Always || e.is_retryable() => {
                crate::common::metrics::METRICS.write_retries.inc();
                tracing::warn!(
                    "{} attempt {} failed: {}, retrying in {:?}",
                    what,
                    attempt,
                    e,
                    delay
                );
                let jitter = std::time::Duration::from_millis(rand::random::<u64>() % 10);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(crate::Error::Cancelled),
                    _ = tokio::time::sleep(delay + jitter) => {}
                }
                delay = (delay * 2).min(policy.max_delay());
            }
            Err(e) => return Err(e),
        }
    }
}
