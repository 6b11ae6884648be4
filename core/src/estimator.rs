use std::collections::VecDeque;

/// Fixed-length moving average weighted toward recent samples, so the
/// reported rate varies smoothly instead of jumping with every sample.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Linearly recency-weighted average: the newest sample weighs n, the
    /// oldest 1.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (index, value) in self.samples.iter().enumerate() {
            let weight = (index + 1) as f64;
            weighted += value * weight;
            weight_sum += weight;
        }
        weighted / weight_sum
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Derives throughput and ETA from observable progress sampled at a fixed
/// one-second cadence, so each delta is a bytes-per-second figure.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    average: MovingAverage,
    last_observed: i64,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self {
            average: MovingAverage::new(5),
            last_observed: 0,
        }
    }

    pub fn sample(&mut self, observed: i64) {
        let delta = (observed - self.last_observed).max(0) as f64;
        self.average.add(delta);
        self.last_observed = observed;
    }

    /// Average bytes per second, zero while unknown.
    pub fn bytes_per_second(&self) -> u64 {
        let average = self.average.average();
        if average < 1.0 {
            0
        } else {
            average.ceil() as u64
        }
    }

    /// Milliseconds until the transfer reaches `total`, `-1` while the rate
    /// is unknown.
    pub fn eta_millis(&self, downloaded: i64, total: u64) -> i64 {
        let rate = self.bytes_per_second();
        if rate == 0 || downloaded < 0 {
            return -1;
        }
        let remaining = (total as i64 - downloaded).max(0);
        ((remaining as f64 / rate as f64) * 1000.0) as i64
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}
