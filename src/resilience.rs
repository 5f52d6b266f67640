//! Bounded polling with exponential backoff.
//!
//! Used to wait for endpoints to report healthy without blocking past a
//! caller-supplied deadline.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

// ============================================================================
// Backoff
// ============================================================================

/// Backoff policy between polls.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second poll.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Fixed interval between polls.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
        }
    }

    /// Calculate delay for a given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()))
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// The awaited condition holds.
    Ready,
    /// Not yet; poll again.
    Pending,
    /// The condition can no longer hold.
    Failed(String),
}

/// Result of polling until a deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
    Failed { reason: String },
}

/// Probes until ready, failed, or `timeout` elapses. Never sleeps past the deadline.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    policy: &BackoffPolicy,
    mut probe: F,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match probe().await {
            Probe::Ready => return PollOutcome::Ready { attempts },
            Probe::Failed(reason) => return PollOutcome::Failed { reason },
            Probe::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut { attempts };
        }

        let delay = policy.delay_for_attempt(attempts).min(deadline - now);
        tracing::trace!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Polling again");
        sleep(delay).await;
    }
}
