//! # detector
//!
//! why: turn "how long since we last heard from a peer" into a suspicion level
//! relations: one per remote PeerHandle in peer.rs; fed by every accepted delta
//! what: phi accrual failure detector over a sliding window of arrival intervals

use std::collections::VecDeque;

use crate::Millis;

/// Phi above which a peer is treated as failed.
pub const DEFAULT_PHI_THRESHOLD: f64 = 8.0;

/// Intervals kept in the sliding window.
pub const MAX_SAMPLES: usize = 100;

/// Floor of the standard deviation as a share of the mean interval. Keeps a
/// perfectly regular sender from being suspected after a single late beat.
const MIN_STD_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct AccrualFailureDetector {
    intervals: VecDeque<Millis>,
    sum: f64,
    sum_sq: f64,
    last_arrival: Option<Millis>,
    first_estimate: Millis,
}

impl AccrualFailureDetector {
    /// `first_estimate` stands in for the interval before a second arrival is seen.
    pub fn new(first_estimate: Millis) -> Self {
        Self {
            intervals: VecDeque::with_capacity(MAX_SAMPLES),
            sum: 0.0,
            sum_sq: 0.0,
            last_arrival: None,
            first_estimate: first_estimate.max(1),
        }
    }

    /// Record an arrival. Arrivals at or before the last one are ignored.
    pub fn add(&mut self, at: Millis) {
        let interval = match self.last_arrival {
            None => self.first_estimate,
            Some(last) if at <= last => return,
            Some(last) => at - last,
        };
        self.last_arrival = Some(at);
        self.push(interval);
    }

    fn push(&mut self, interval: Millis) {
        if self.intervals.len() == MAX_SAMPLES {
            if let Some(dropped) = self.intervals.pop_front() {
                let dropped = dropped as f64;
                self.sum -= dropped;
                self.sum_sq -= dropped * dropped;
            }
        }
        let value = interval as f64;
        self.sum += value;
        self.sum_sq += value * value;
        self.intervals.push_back(interval);
    }

    pub fn last_arrival(&self) -> Option<Millis> {
        self.last_arrival
    }

    pub fn samples(&self) -> usize {
        self.intervals.len()
    }

    pub fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        self.sum / self.intervals.len() as f64
    }

    fn std_dev(&self, mean: f64) -> f64 {
        let n = self.intervals.len() as f64;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        variance.sqrt().max((mean * MIN_STD_RATIO).max(1.0))
    }

    /// Suspicion level at `now`. Zero until the first arrival.
    pub fn phi(&self, now: Millis) -> f64 {
        let Some(last) = self.last_arrival else {
            return 0.0;
        };
        if self.intervals.is_empty() {
            return 0.0;
        }
        let gap = now.saturating_sub(last) as f64;
        let mean = self.mean();
        let std_dev = self.std_dev(mean);

        // logistic approximation of the normal cdf
        let y = (gap - mean) / std_dev;
        let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
        if gap > mean {
            -(e / (1.0 + e)).log10()
        } else {
            -(1.0 - 1.0 / (1.0 + e)).log10()
        }
    }
}
