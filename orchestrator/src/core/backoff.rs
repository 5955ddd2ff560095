//! Poll interval schedule for batch jobs.

use std::time::Duration;

/// Exponential backoff for pending/running jobs, with a fixed short interval
/// for jobs that are finishing up.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Sleep used while the job reports `COMPLETING`; never grows.
    pub completing: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            multiplier: 1.5,
            max: Duration::from_secs(120),
            completing: Duration::from_secs(5),
        }
    }
}

impl PollSchedule {
    /// Interval that follows `current`, capped at `max`.
    pub fn grow(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_grows_then_caps() {
        let schedule = PollSchedule::default();
        let mut interval = schedule.initial;
        let mut seen = vec![interval.as_secs_f64()];
        for _ in 0..5 {
            interval = schedule.grow(interval);
            seen.push(interval.as_secs_f64());
        }
        assert_eq!(seen, vec![30.0, 45.0, 67.5, 101.25, 120.0, 120.0]);
    }

    #[test]
    fn unbounded_multiplier_caps_instead_of_overflowing() {
        for multiplier in [f64::INFINITY, f64::NAN, 1e300] {
            let schedule = PollSchedule {
                multiplier,
                ..PollSchedule::default()
            };
            assert_eq!(schedule.grow(schedule.initial), schedule.max);
        }
    }
}
