use std::cmp::min;
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use crate::config::ArqConfig;

/// Result of racing a receive operation against the ack timer
#[derive(Debug, PartialEq, Eq)]
pub enum AckWait<T> {
    Completed(T),
    TimedOut,
}

/// Timing policy for retransmissions.
///
/// There are two different retry paths: An ack timeout retransmits immediately (the timeout
///  itself is the delay), while a failed *send* operation waits for an exponentially growing
///  backoff first. Both count against the same budget.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    ack_timeout: Duration,
    backoff_base: Duration,
    max_retries: u32,
}

impl RetryScheduler {
    pub fn new(config: &ArqConfig) -> RetryScheduler {
        RetryScheduler {
            ack_timeout: config.ack_timeout,
            backoff_base: config.backoff_base,
            max_retries: config.max_retries,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The point in time at which a wait for an ack that starts now times out
    pub fn ack_deadline(&self) -> Instant {
        Instant::now() + self.ack_timeout
    }

    /// Single-shot ack timer: Races `receive` against the configured ack timeout.
    pub async fn wait_for_ack<F: Future>(&self, receive: F) -> AckWait<F::Output> {
        self.wait_for_ack_until(self.ack_deadline(), receive).await
    }

    /// Races `receive` against a fixed deadline, so that several receive operations for the
    ///  same outstanding packet share a single timeout.
    ///
    /// Whichever side loses the race is dropped. In particular, a receive future that is still
    ///  pending when the timer fires is cancelled, so a late datagram is not consumed by it -
    ///  it stays in the socket to be seen by the next receive operation.
    pub async fn wait_for_ack_until<F: Future>(&self, deadline: Instant, receive: F) -> AckWait<F::Output> {
        match timeout_at(deadline, receive).await {
            Ok(result) => AckWait::Completed(result),
            Err(_) => AckWait::TimedOut,
        }
    }

    /// `backoff_base * 2^retry_count`. The exponent is capped at the retry budget since there
    ///  are no retries beyond that.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = min(retry_count, self.max_retries);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }

    /// `true` if a packet that failed `retry_count` times must not be transmitted again
    pub fn budget_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
