//! Tolerance checks for measured durations.
//!
//! Recovery bounds are expressed relative to a timeout the service is configured with, and the
//! harness only observes the service by polling. Measured durations are therefore compared
//! against multiplicative bands around the reference, never for equality.

/// Closed band `[low * reference, high * reference]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingBand {
    pub low: f64,
    pub high: f64,
}

/// Capability handover after a client died: the holder's session must go stale first.
pub const STALE_HANDOVER: TimingBand = TimingBand::new(0.5, 2.0);

/// Eviction short-circuits a wait that would otherwise last a full timeout.
pub const FAST_PATH_FRACTION: f64 = 0.5;

impl TimingBand {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn bounds(
        &self,
        reference: std::time::Duration,
    ) -> (std::time::Duration, std::time::Duration) {
        (reference.mul_f64(self.low), reference.mul_f64(self.high))
    }

    pub fn contains(&self, elapsed: std::time::Duration, reference: std::time::Duration) -> bool {
        let (low, high) = self.bounds(reference);
        low <= elapsed && elapsed <= high
    }
}

/// `elapsed < fraction * reference`
pub fn under_fraction(
    elapsed: std::time::Duration,
    reference: std::time::Duration,
    fraction: f64,
) -> bool {
    elapsed < reference.mul_f64(fraction)
}

/// `elapsed > fraction * reference`
pub fn over_fraction(
    elapsed: std::time::Duration,
    reference: std::time::Duration,
    fraction: f64,
) -> bool {
    elapsed > reference.mul_f64(fraction)
}

pub fn format(duration: std::time::Duration) -> humantime::FormattedDuration {
    humantime::format_duration(duration)
}
