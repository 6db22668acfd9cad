//! Rolling accelerometer window attached to movement events as a telemetry snapshot.

use std::collections::VecDeque;

use crate::models::SensorTelemetry;

pub const DEFAULT_CAPACITY: usize = 250;
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    x: f64,
    y: f64,
    z: f64,
}

impl Sample {
    fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Fixed-capacity ring of tri-axial samples. Not synchronized; the owner serializes access.
#[derive(Debug, Clone)]
pub struct TelemetryBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
    sample_rate_hz: f64,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SAMPLE_RATE_HZ)
    }
}

impl TelemetryBuffer {
    pub fn new(capacity: usize, sample_rate_hz: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate_hz: sanitize_rate(sample_rate_hz),
        }
    }

    pub fn add(&mut self, x: f64, y: f64, z: f64) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { x, y, z });
    }

    /// Mean Euclidean magnitude.
    pub fn magnitude(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(Sample::magnitude).sum();
        Some(sum / self.samples.len() as f64)
    }

    /// Sample variance (n - 1) of magnitudes.
    pub fn variance(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let mean = self.magnitude()?;
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|sample| (sample.magnitude() - mean).powi(2))
            .sum();
        Some(sum_sq / (n - 1) as f64)
    }

    /// Zero-crossing estimate of the dominant frequency in Hz.
    ///
    /// Magnitudes are centred on their mean; every sign change is half a cycle.
    /// Samples sitting exactly on the mean do not count as a sign.
    pub fn peak_frequency(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 3 {
            return None;
        }
        let mean = self.magnitude()?;

        let mut crossings = 0usize;
        let mut previous_sign = 0i8;
        for sample in &self.samples {
            let centred = sample.magnitude() - mean;
            let sign = if centred > 0.0 {
                1
            } else if centred < 0.0 {
                -1
            } else {
                0
            };
            if sign != 0 {
                if previous_sign != 0 && sign != previous_sign {
                    crossings += 1;
                }
                previous_sign = sign;
            }
        }

        let span_secs = (n - 1) as f64 / self.sample_rate_hz;
        Some(crossings as f64 / 2.0 / span_secs)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinking drops the oldest samples.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate_hz: f64) {
        self.sample_rate_hz = sanitize_rate(sample_rate_hz);
    }

    pub fn snapshot(&self) -> SensorTelemetry {
        SensorTelemetry {
            accelerometer_magnitude: self.magnitude(),
            accelerometer_variance: self.variance(),
            accelerometer_peak_frequency: self.peak_frequency(),
            sample_count: self.samples.len(),
        }
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        DEFAULT_SAMPLE_RATE_HZ
    }
}
