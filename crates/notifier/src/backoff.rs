use rand::Rng;
use std::time::Duration;

/// Backoff computes randomized, exponentially increasing delays between
/// retries, so that workers of many processes don't hammer a recovering
/// Store (or sender) in lock-step.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Backoff {
    /// Delay of the first retry.
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Upper bound of any delay, before jitter.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Delays are jittered uniformly by this percent in either direction.
    pub jitter_percent: u16,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            jitter_percent: 10,
        }
    }
}

impl Backoff {
    /// Delay before the retry which follows `attempt` failed attempts,
    /// where the first failure is attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter_percent.min(100) as f64 / 100.0;

        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let mul = rand::thread_rng().gen_range((1.0 - jitter)..(1.0 + jitter));
        base.mul_f64(mul)
    }

    /// Delay before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1 << doublings)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Sleep for the delay of `attempt`, returning early (and false)
    /// if `shutdown` is cancelled first.
    pub async fn sleep(
        &self,
        attempt: u32,
        shutdown: &tokio_util::sync::CancellationToken,
    ) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.delay(attempt)) => true,
            () = shutdown.cancelled() => false,
        }
    }
}
