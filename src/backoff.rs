use std::time::Duration;
use tokio::time::sleep;

/// Retry pacing for loops that would otherwise spin against a swarm with
/// nothing obtainable: the delay doubles from `base` up to `max`, and
/// resets whenever the caller makes progress.
pub struct GrowingBackoff {
    base: f64,
    max: f64,
    failed_attempts: u32,
}

impl GrowingBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base: base.as_secs_f64(),
            max: max.as_secs_f64(),
            failed_attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.failed_attempts = 0;
    }

    pub async fn tick(&mut self) {
        let delay = (self.base * f64::from(1 << self.failed_attempts.min(16))).min(self.max);

        sleep(Duration::from_secs_f64(delay)).await;

        self.failed_attempts += 1;
    }
}
