use std::time::Duration;

/// Delays between attempts of one model invocation.
///
/// The attempt budget is not here: it is always the credential count plus
/// one, so every credential gets a chance and one more try is left for a
/// credential that came back from cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First backoff after a transient failure.
    pub base_delay: Duration,
    /// Cap for later transient backoffs.
    pub max_delay: Duration,
    /// Fixed pause after a quota failure. Rotation does the real work.
    pub quota_delay: Duration,
    /// Bound on a single backend attempt.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            quota_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            quota_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Exponential backoff for the given retry (1-based), plus up to 20%
    /// jitter, capped at `max_delay`.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let shift = retry_index.saturating_sub(1).min(31);
        let base = self
            .base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        (base + jitter(base / 5)).min(self.max_delay)
    }
}

/// Uniform over `0..=spread`.
fn jitter(spread: Duration) -> Duration {
    if spread.is_zero() {
        return Duration::ZERO;
    }
    spread.mul_f64(rand::random::<f64>())
}
