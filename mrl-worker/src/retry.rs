//! What to do when the master connection drops.

use std::time::Duration;

use rand::Rng;

/// Decides whether, and when, to reconnect to the master.
pub trait ReconnectPolicy: Send {
    /// Delay before reconnect attempt number `attempt` (starting at 1), or
    /// `None` to give up and stop the node.
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// Called once a connection has been re-established.
    fn reset(&mut self) {}
}

/// Never reconnect: a closed master connection stops the node.
#[derive(Debug, Default, Clone, Copy)]
pub struct Never;

impl ReconnectPolicy for Never {
    fn next_delay(&mut self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with up to 20% random jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts,
        }
    }

    /// Delay before `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1 << exponent)
            .min(self.max)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let delay = self.base_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        Some(delay.mul_f64(1.0 + jitter).min(self.max))
    }
}

/// Build the policy for `--reconnect-attempts`.
pub fn from_attempts(attempts: u32) -> Box<dyn ReconnectPolicy> {
    if attempts == 0 {
        Box::new(Never)
    } else {
        Box::new(ExponentialBackoff::new(attempts))
    }
}
