//! Retry policies for failed chunk operations.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StorageError;

/// Decides whether a failed chunk is retried.
#[async_trait]
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// Returns true if the chunk should be retried, sleeping first if needed.
    async fn next(&mut self, err: &StorageError) -> bool;

    /// Clears retry state before the next chunk.
    fn reset(&mut self);
}

/// Sleeps a fixed duration between attempts, up to `max` retries per chunk.
///
/// A retry-after hint carried by `StorageError::Throttled` replaces the fixed sleep.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    sleep: Duration,
    max: u32,
    tried: u32,
}

impl ConstantBackoff {
    /// Create a constant backoff.
    #[must_use]
    pub fn new(sleep: Duration, max: u32) -> Self {
        Self {
            sleep,
            max,
            tried: 0,
        }
    }

    /// Retries made for the current chunk.
    #[must_use]
    pub const fn tried(&self) -> u32 {
        self.tried
    }
}

#[async_trait]
impl Backoff for ConstantBackoff {
    async fn next(&mut self, err: &StorageError) -> bool {
        self.tried += 1;
        if self.tried > self.max {
            return false;
        }

        let delay = match err {
            StorageError::Throttled { retry_after, .. } if !retry_after.is_zero() => {
                warn!(
                    error = %err,
                    retry_after = ?retry_after,
                    "Retryable error in backoff, sleeping for the requested delay"
                );
                *retry_after
            }
            _ => self.sleep,
        };
        tokio::time::sleep(delay).await;
        true
    }

    fn reset(&mut self) {
        self.tried = 0;
    }
}

/// Never retries. Used by purely signed flows where a retry cannot help.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

#[async_trait]
impl Backoff for NoBackoff {
    async fn next(&mut self, _err: &StorageError) -> bool {
        false
    }

    fn reset(&mut self) {}
}
