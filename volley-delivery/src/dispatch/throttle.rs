//! Outbound pacing between batch releases.

use std::time::Duration;

/// Pause schedule for the batch feeder.
///
/// With throttling enabled the pause after each batch is long enough to keep
/// the campaign under `emails_per_hour`, and never shorter than the minimum
/// delay. Batches are released in waves of `wave_size`, each followed by
/// one pause covering the whole wave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    pub enabled: bool,
    pub emails_per_hour: f64,
    pub min_batch_delay: Duration,
    pub wave_size: usize,
}

impl Throttle {
    /// The pause owed for one batch of `batch_size` recipients.
    #[must_use]
    pub fn batch_delay(&self, batch_size: usize) -> Duration {
        if !self.enabled || self.emails_per_hour <= 0.0 {
            return self.min_batch_delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let seconds = batch_size as f64 / (self.emails_per_hour / 3600.0);

        Duration::try_from_secs_f64(seconds)
            .map_or(self.min_batch_delay, |paced| paced.max(self.min_batch_delay))
    }

    /// The pause after a full wave.
    #[must_use]
    pub fn wave_delay(&self, batch_size: usize) -> Duration {
        let wave = u32::try_from(self.wave_size.max(1)).unwrap_or(u32::MAX);
        self.batch_delay(batch_size).saturating_mul(wave)
    }

    #[must_use]
    pub const fn wave_size(&self) -> usize {
        if self.wave_size == 0 { 1 } else { self.wave_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(enabled: bool, emails_per_hour: f64, min_secs: u64) -> Throttle {
        Throttle {
            enabled,
            emails_per_hour,
            min_batch_delay: Duration::from_secs(min_secs),
            wave_size: 1,
        }
    }

    #[test]
    fn test_rate_bound_dominates() {
        // 200 recipients at 3600/hour is one per second.
        assert_eq!(
            throttle(true, 3600.0, 60).batch_delay(200),
            Duration::from_secs(200)
        );
    }

    #[test]
    fn test_minimum_dominates() {
        assert_eq!(
            throttle(true, 360_000.0, 60).batch_delay(200),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_disabled_uses_minimum() {
        assert_eq!(
            throttle(false, 100.0, 5).batch_delay(200),
            Duration::from_secs(5)
        );
        assert_eq!(throttle(false, 100.0, 0).batch_delay(200), Duration::ZERO);
    }

    #[test]
    fn test_wave_delay_scales() {
        let mut throttle = throttle(true, 3600.0, 0);
        throttle.wave_size = 3;
        assert_eq!(throttle.wave_size(), 3);
        assert_eq!(throttle.wave_delay(10), Duration::from_secs(30));

        throttle.wave_size = 0;
        assert_eq!(throttle.wave_size(), 1);
    }
}
