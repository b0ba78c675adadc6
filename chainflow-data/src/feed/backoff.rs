use std::time::Duration;

/// Exponential reconnect backoff, without retry limit.
///
/// Every reconnect waits at least `initial_delay`, so a flapping endpoint is never hammered.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    current_delay: Duration,
    attempt: usize,
}

impl ReconnectBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        let max_delay = max_delay.max(initial_delay);
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Fixed delay backoff.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Next delay, advancing the backoff state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier),
            self.max_delay,
        );
        delay
    }

    /// Reset after a connection has been re-established.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    pub fn attempt_number(&self) -> usize {
        self.attempt
    }
}
