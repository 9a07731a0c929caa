//! Accepted-share rates and the band vardiff steers into.

use std::time::Duration;

/// Accepted-share rate (shares per unit time).
///
/// Internally stores the average interval between shares, so a `ShareRate`
/// is always positive. An idle window is represented by the absence of a
/// rate, not by a zero rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareRate(Duration);

impl ShareRate {
    /// Create a rate of N shares per minute.
    ///
    /// # Panics
    /// Panics if `shares` is not positive.
    pub fn per_minute(shares: f64) -> Self {
        assert!(shares > 0.0, "share rate must be positive");
        Self(Duration::from_secs_f64(60.0 / shares))
    }

    /// Rate observed from `count` shares over `window`.
    ///
    /// Returns `None` when there were no shares or the window is empty.
    pub fn observed(count: usize, window: Duration) -> Option<Self> {
        if count == 0 || window.is_zero() {
            return None;
        }
        Some(Self(window.div_f64(count as f64)))
    }

    /// Get the rate as shares per minute.
    pub fn as_per_minute(&self) -> f64 {
        60.0 / self.0.as_secs_f64()
    }

    /// Get the average interval between shares.
    pub fn as_interval(&self) -> Duration {
        self.0
    }
}

impl std::fmt::Display for ShareRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per_min = self.as_per_minute();
        if per_min >= 1.0 {
            write!(f, "{:.1} shares/min", per_min)
        } else {
            write!(f, "{:.3} shares/sec", per_min / 60.0)
        }
    }
}

/// Inclusive band of acceptable share rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBand {
    pub min: ShareRate,
    pub max: ShareRate,
}

impl RateBand {
    pub fn per_minute(min: f64, max: f64) -> Self {
        Self {
            min: ShareRate::per_minute(min),
            max: ShareRate::per_minute(max),
        }
    }

    pub fn contains(&self, rate: ShareRate) -> bool {
        let r = rate.as_per_minute();
        r >= self.min.as_per_minute() && r <= self.max.as_per_minute()
    }

    /// Arithmetic midpoint, in shares per minute.
    pub fn midpoint_per_minute(&self) -> f64 {
        (self.min.as_per_minute() + self.max.as_per_minute()) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_minute_conversion() {
        let rate = ShareRate::per_minute(6.0);
        assert!((rate.as_per_minute() - 6.0).abs() < 1e-9);
        assert!((rate.as_interval().as_secs_f64() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_observed() {
        let rate = ShareRate::observed(30, Duration::from_secs(60)).unwrap();
        assert!((rate.as_per_minute() - 30.0).abs() < 1e-9);
        assert!(ShareRate::observed(0, Duration::from_secs(60)).is_none());
        assert!(ShareRate::observed(5, Duration::ZERO).is_none());
    }

    #[test]
    fn test_band() {
        let band = RateBand::per_minute(10.0, 20.0);
        assert!(band.contains(ShareRate::per_minute(10.0)));
        assert!(band.contains(ShareRate::per_minute(15.0)));
        assert!(!band.contains(ShareRate::per_minute(25.0)));
        assert!(!band.contains(ShareRate::per_minute(5.0)));
        assert!((band.midpoint_per_minute() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        assert_eq!(ShareRate::per_minute(6.0).to_string(), "6.0 shares/min");
        assert_eq!(ShareRate::per_minute(0.6).to_string(), "0.010 shares/sec");
    }
}
