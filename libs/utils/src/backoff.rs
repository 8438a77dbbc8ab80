//! Capped exponential backoff for retrying fallible async operations.

use std::fmt::{Debug, Display};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

pub async fn exponential_backoff(
    n: u32,
    base_increment: f64,
    max_seconds: f64,
    cancel: &CancellationToken,
) {
    let backoff_duration_seconds = exponential_backoff_duration_seconds(n, base_increment, max_seconds);
    if backoff_duration_seconds > 0.0 {
        info!("Backoff: waiting {backoff_duration_seconds} seconds before processing with the task");
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs_f64(backoff_duration_seconds)) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (1.0 + base_increment).powf(f64::from(n)).min(max_seconds)
    }
}

/// Retry a failure-prone async operation, backing off exponentially between
/// attempts. Returns `None` if cancelled, otherwise the last result once it
/// succeeds, is deemed permanent by `is_permanent`, or `max_retries` is spent.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    // Not std::error::Error because anyhow::Error doesn't implement it.
    E: Display + Debug + 'static,
    O: FnMut() -> F,
    F: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let result = op().await;
        match &result {
            Ok(_) => {
                if attempts > 0 {
                    info!("{description} succeeded after {attempts} retries");
                }
                return Some(result);
            }
            Err(e) if is_permanent(e) => {
                return Some(result);
            }
            Err(e) => {
                if attempts < warn_threshold {
                    info!("{description} failed, will retry (attempt {attempts}): {e:#}");
                } else if attempts < max_retries {
                    warn!("{description} failed, will retry (attempt {attempts}): {e:#}");
                } else {
                    warn!("{description} still failed after {attempts} retries, giving up: {e:?}");
                    return Some(result);
                }
            }
        }
        exponential_backoff(
            attempts,
            DEFAULT_BASE_BACKOFF_SECONDS,
            DEFAULT_MAX_BACKOFF_SECONDS,
            cancel,
        )
        .await;
        attempts += 1;
    }
}
