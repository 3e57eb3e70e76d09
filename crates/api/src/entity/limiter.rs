//! Download speed limiting.

use std::io;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{Duration, Instant, sleep};

/// Token bucket refilled at `rate` bytes per second with one second of burst.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Bucket for `bytes_per_sec`, starting full.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    /// Take `n` tokens, sleeping until the bucket has paid them back.
    #[allow(clippy::cast_precision_loss)]
    pub async fn acquire(&mut self, n: usize) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.tokens -= n as f64;
        if self.tokens < 0.0 {
            sleep(Duration::from_secs_f64(-self.tokens / self.rate)).await;
        }
    }
}

/// Limit `body` to `bytes_per_sec`; zero leaves it untouched.
#[must_use]
pub fn throttle(
    body: BoxStream<'static, io::Result<Bytes>>,
    bytes_per_sec: u64,
) -> BoxStream<'static, io::Result<Bytes>> {
    if bytes_per_sec == 0 {
        return body;
    }
    stream::unfold(
        (body, TokenBucket::new(bytes_per_sec)),
        |(mut body, mut bucket)| async move {
            let chunk = body.next().await?;
            if let Ok(bytes) = &chunk {
                bucket.acquire(bytes.len()).await;
            }
            Some((chunk, (body, bucket)))
        },
    )
    .boxed()
}
