use std::time::Duration;
use tokio::time::sleep;

/// Doubling retry delay, capped, with a bounded number of attempts.
///
/// Delays are in milliseconds.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: u64,
    max_delay: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay: initial_ms,
            max_delay: max_ms,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay the next `sleep()` would wait, if any attempts remain
    pub fn next_delay(&self) -> Option<u64> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        let factor = 2_u64.saturating_pow(self.current_attempt);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay
        );

        sleep(Duration::from_millis(delay)).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}
