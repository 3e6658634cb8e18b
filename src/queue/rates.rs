//! Rolling ingress/egress rate tracking, driving `target_ram_count`
//! recomputation (spec.md §4.E, §9 "two-sample rolling window").

use std::time::{Duration, Instant};

/// A two-sample rolling-window rate: the previous sampled count and
/// timestamp are kept just long enough to compute one rate, then replaced.
#[derive(Clone, Copy, Debug)]
pub struct RateTracker {
    previous: (Instant, u64),
    current_count: u64,
    rate_per_sec: f64,
}

impl RateTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            previous: (now, 0),
            current_count: 0,
            rate_per_sec: 0.0,
        }
    }

    /// Records `n` events having occurred since the last [`Self::sample`].
    pub fn record(&mut self, n: u64) {
        self.current_count += n;
    }

    /// Folds the accumulated count into a new rate estimate and starts a
    /// fresh window. Intended to be called on `ram_duration_update_interval`
    /// (spec.md §6).
    pub fn sample(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.previous.0);
        if elapsed > Duration::ZERO {
            self.rate_per_sec = self.current_count as f64 / elapsed.as_secs_f64();
        }
        self.previous = (now, self.current_count);
        self.current_count = 0;
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }
}

/// The four rates tracked per queue: publishes and deliveries (message
/// traffic) plus acks and requeues (acknowledgement traffic), sampled
/// independently since a consumer can ack far behind where it delivers.
pub struct QueueRates {
    pub publish: RateTracker,
    pub deliver: RateTracker,
    pub ack: RateTracker,
    pub requeue: RateTracker,
}

impl QueueRates {
    pub fn new(now: Instant) -> Self {
        Self {
            publish: RateTracker::new(now),
            deliver: RateTracker::new(now),
            ack: RateTracker::new(now),
            requeue: RateTracker::new(now),
        }
    }

    pub fn sample_all(&mut self, now: Instant) {
        self.publish.sample(now);
        self.deliver.sample(now);
        self.ack.sample(now);
        self.requeue.sample(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_reflects_events_over_the_window() {
        let t0 = Instant::now();
        let mut tracker = RateTracker::new(t0);
        tracker.record(10);
        let t1 = t0 + Duration::from_secs(2);
        tracker.sample(t1);
        assert!((tracker.rate_per_sec() - 5.0).abs() < 0.01);
    }
}
