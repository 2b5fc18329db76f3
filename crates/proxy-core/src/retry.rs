use std::time::Duration;

/// Exponential backoff policy shared by the sync loop and history fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before retry number `attempt` (zero-based), doubling per
    /// attempt up to the cap.
    ///
    /// A server-supplied retry hint wins over the computed delay when it is
    /// larger, but never exceeds the cap.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let doubled = self
            .base
            .checked_mul(1_u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        let hinted = hint.unwrap_or(Duration::ZERO);
        doubled.max(hinted).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
