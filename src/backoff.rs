use std::time::Duration;

/// Delay after failed attempt `attempt` (1-based) under a linear schedule: 1x, 2x, 3x ... `step`.
pub fn linear_backoff(attempt: u32, step: Duration) -> Duration {
    step * attempt.max(1)
}

/// Bounded attempt schedule shared by the poll loop and the downloader.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
    pub linear: bool,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self { attempts, step: interval, linear: false }
    }

    pub fn linear(attempts: u32, step: Duration) -> Self {
        Self { attempts, step, linear: true }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.linear { linear_backoff(attempt, self.step) } else { self.step }
    }
}
