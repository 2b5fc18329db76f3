use std::time::{Duration, Instant};

/// Minimum-delay admission control for automatically discovered gap tasks.
///
/// A first sync after a long offline period can expose gaps in many rooms
/// at once; the throttle spreads the resulting history requests out, one
/// per interval. Continuation tasks chained by the fetcher are not subject
/// to it.
#[derive(Debug, Clone)]
pub struct GapThrottle {
    min_interval: Duration,
    last_admit: Option<Instant>,
}

impl GapThrottle {
    /// A zero interval disables throttling entirely.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admit: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Admit one gap task if the interval has elapsed since the last
    /// admission.
    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    /// Deterministic variant of [`admit`](Self::admit) for tests.
    pub fn admit_at(&mut self, now: Instant) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }

        match self.last_admit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_admit = Some(now);
                true
            }
        }
    }
}
