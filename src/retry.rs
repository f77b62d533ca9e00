//! Retry with exponential backoff for calls that cross a process
//! boundary (embedding provider, chat provider).

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            backoff_factor: 1,
        }
    }
}

/// Run `op`, retrying transient failures up to `policy.max_attempts`
/// total attempts. Non-transient errors surface immediately.
pub fn with_retry<T>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: impl FnMut() -> CoreResult<T>,
) -> CoreResult<T> {
    let mut delay = policy.base_delay;
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "transient failure, retrying"
                );
                std::thread::sleep(delay);
                delay *= policy.backoff_factor;
            }
            Err(err) => return Err(err),
        }
    }

    Err(CoreError::Internal(format!("retry loop exited for {op_name}")))
}
