//! Retry policy for transient blob store failures.
//!
//! [`retry_with_backoff`] retries up to a fixed number of attempts with fixed
//! or exponential backoff. Exponential delays carry up to 50% random jitter so
//! that writers and readers hitting a throttled store do not retry in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Backoff strategy for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: delay doubles each retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        match self {
            Backoff::Fixed(_) => delay,
            Backoff::Exponential { .. } => {
                let half = delay.as_millis() as u64 / 2;
                if half == 0 {
                    return delay;
                }
                let jitter = rand::rng().random_range(0..=half);
                delay - Duration::from_millis(half) + Duration::from_millis(jitter)
            }
        }
    }
}

/// Retry configuration for blob store calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::Exponential {
            initial: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Retry an operation up to `max_retries` times with configurable backoff.
///
/// Total attempts = 1 + `max_retries`. On each failure, `is_retryable` is
/// called: non-retryable errors are returned immediately without further
/// attempts. `on_retry` runs before every sleep.
pub async fn retry_with_backoff<T, E, F, Fut, R, O>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
    mut on_retry: O,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
    O: FnMut(u32),
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_retries {
                    return Err(e);
                }
                let sleep_for = backoff.jittered(delay);
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = sleep_for.as_millis() as u64,
                    description,
                    error = %e,
                    "blob store call failed, retrying with backoff"
                );
                on_retry(attempt + 1);
                tokio::time::sleep(sleep_for).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}
