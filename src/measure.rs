use std::time::{Duration, Instant};

/// sliding-window transfer rate estimator.
///
/// the rate is the number of bytes seen since `rate_since` divided by the elapsed time, where
/// `rate_since` trails the latest sample by at most `max_rate_period`. starting `rate_since`
/// `fudge` seconds in the past keeps the very first sample from reading as a huge spike.
#[derive(Debug, Clone)]
pub struct Measure {
    epoch: Instant,
    max_rate_period: f64,
    // seconds relative to `epoch`, may be negative because of the fudge
    rate_since: f64,
    last: f64,
    rate: f64,
    total: u64,
}

impl Measure {
    pub const DEFAULT_FUDGE: f64 = 5.0;

    pub fn new(max_rate_period: f64, now: Instant) -> Self {
        Self::with_fudge(max_rate_period, Self::DEFAULT_FUDGE, now)
    }

    pub fn with_fudge(max_rate_period: f64, fudge: f64, now: Instant) -> Self {
        Self {
            epoch: now,
            max_rate_period,
            rate_since: -fudge,
            last: -fudge,
            rate: 0.0,
            total: 0,
        }
    }

    fn seconds(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.epoch).as_secs_f64()
    }

    pub fn update_rate(&mut self, now: Instant, amount: u64) {
        self.total += amount;
        let t = self.seconds(now).max(self.last);
        let span = t - self.rate_since;
        if span > 0.0 {
            self.rate = (self.rate * (self.last - self.rate_since) + amount as f64) / span;
        }
        self.last = t;
        if self.rate_since < t - self.max_rate_period {
            self.rate_since = t - self.max_rate_period;
        }
    }

    /// current rate in bytes/sec, decayed up to `now`.
    pub fn get_rate(&mut self, now: Instant) -> f64 {
        self.update_rate(now, 0);
        self.rate
    }

    pub fn get_rate_noupdate(&self) -> f64 {
        self.rate
    }

    /// how long to stay idle for the rate to fall to `new_rate`.
    pub fn time_until_rate(&self, now: Instant, new_rate: f64) -> Duration {
        if self.rate <= new_rate || new_rate <= 0.0 {
            return Duration::ZERO;
        }
        let t = self.seconds(now) - self.rate_since;
        Duration::from_secs_f64(((self.rate * t) / new_rate - t).max(0.0))
    }

    pub fn get_total(&self) -> u64 {
        self.total
    }
}
