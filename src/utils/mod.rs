//! Shared helpers

pub mod retry;

use std::time::Duration;

pub use retry::{with_retry_if, RetryConfig};

/// Render a duration as whole milliseconds for log fields
pub fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
