//! Duty-cycle throttling for the worker loop.
//!
//! With a maximum duty cycle `d`, a worker that spent `w` working must stay idle
//! for `w × (1/d − 1)` before its next cycle, minus whatever time has already
//! passed since the work ended. `d = 1.0` never forces idle time.

use std::time::Duration;
use tokio::time::Instant;

/// Tracks the last work cycle and computes the idle time before the next one.
#[derive(Debug, Clone)]
pub struct DutyCycle {
    max_duty_cycle: f64,
    last_work: Option<(Duration, Instant)>,
}

impl DutyCycle {
    /// `max_duty_cycle` must lie in `(0, 1]`; configuration validation
    /// enforces this before a worker is built.
    pub fn new(max_duty_cycle: f64) -> Self {
        Self {
            max_duty_cycle,
            last_work: None,
        }
    }

    /// Record a work cycle that ran from `started` to `finished`.
    pub fn record(&mut self, started: Instant, finished: Instant) {
        self.last_work = Some((finished.saturating_duration_since(started), finished));
    }

    /// Minimum gap the duty cycle requires after the last work cycle.
    pub fn min_interval(&self) -> Duration {
        let Some((work, _)) = self.last_work else {
            return Duration::ZERO;
        };
        let factor = (1.0 / self.max_duty_cycle - 1.0).max(0.0);
        Duration::try_from_secs_f64(work.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    /// Time to sleep at `now` before the next cycle, never less than `at_least`.
    pub fn idle_time(&self, now: Instant, at_least: Duration) -> Duration {
        let required = match self.last_work {
            Some((_, ended)) => self
                .min_interval()
                .saturating_sub(now.saturating_duration_since(ended)),
            None => Duration::ZERO,
        };
        required.max(at_least)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_full_duty_cycle_never_waits() {
        let mut duty = DutyCycle::new(1.0);
        let start = Instant::now();
        duty.record(start, start + Duration::from_secs(10));
        assert_eq!(duty.min_interval(), Duration::ZERO);
        assert_eq!(
            duty.idle_time(start + Duration::from_secs(10), Duration::ZERO),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_duty_cycle_matches_work_time() {
        let mut duty = DutyCycle::new(0.5);
        let start = Instant::now();
        let ended = start + Duration::from_secs(4);
        duty.record(start, ended);

        assert_eq!(duty.idle_time(ended, Duration::ZERO), Duration::from_secs(4));
        assert_eq!(
            duty.idle_time(ended + Duration::from_secs(1), Duration::ZERO),
            Duration::from_secs(3)
        );
        assert_eq!(
            duty.idle_time(ended + Duration::from_secs(10), Duration::ZERO),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_least_is_a_floor() {
        let mut duty = DutyCycle::new(0.25);
        let start = Instant::now();
        let ended = start + Duration::from_secs(1);
        duty.record(start, ended);

        // 1s of work at 25% requires 3s idle.
        assert_eq!(duty.idle_time(ended, Duration::from_secs(1)), Duration::from_secs(3));
        assert_eq!(duty.idle_time(ended, Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_history() {
        let duty = DutyCycle::new(0.1);
        assert_eq!(
            duty.idle_time(Instant::now(), Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}
