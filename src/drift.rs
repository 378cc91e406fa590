//! Rolling-mean drift monitor.
//!
//! Flags a value whose relative distance from the mean of the last `window`
//! values (itself included) exceeds `threshold`. Detection is advisory: it is
//! logged and reported, never fed back into decisions.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub value: f64,
    pub mean: f64,
    pub deviation: f64,
    pub drifted: bool,
}

#[derive(Debug, Clone)]
pub struct DriftMonitor {
    window: usize,
    threshold: f64,
    values: VecDeque<f64>,
    sum: f64,
    drifted: bool,
}

impl Default for DriftMonitor {
    fn default() -> Self {
        Self::new(20, 0.15)
    }
}

impl DriftMonitor {
    pub fn new(window: usize, threshold: f64) -> Self {
        let window = window.max(1);
        Self { window, threshold, values: VecDeque::with_capacity(window), sum: 0.0, drifted: false }
    }

    pub fn update(&mut self, value: f64) -> DriftReport {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.window {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        let mean = self.sum / self.values.len() as f64;
        let denom = if mean == 0.0 { 1.0 } else { mean.abs() };
        let deviation = (value - mean).abs() / denom;
        self.drifted = deviation > self.threshold;
        DriftReport { value, mean, deviation, drifted: self.drifted }
    }

    pub fn drifted(&self) -> bool {
        self.drifted
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_series_no_drift() {
        let mut m = DriftMonitor::default();
        for _ in 0..30 {
            assert!(!m.update(50.0).drifted);
        }
        assert_eq!(m.len(), 20);
    }

    #[test]
    fn test_jump_flags_drift() {
        let mut m = DriftMonitor::default();
        for _ in 0..19 {
            m.update(50.0);
        }
        // mean = (19*50 + 70) / 20 = 51, deviation = 19/51
        let r = m.update(70.0);
        assert!((r.mean - 51.0).abs() < 1e-12);
        assert!(r.drifted);
        assert!(m.drifted());
    }

    #[test]
    fn test_small_move_below_threshold() {
        let mut m = DriftMonitor::default();
        for _ in 0..19 {
            m.update(100.0);
        }
        assert!(!m.update(110.0).drifted);
    }

    #[test]
    fn test_zero_mean_uses_unit_denominator() {
        let mut m = DriftMonitor::new(2, 0.15);
        m.update(-0.1);
        // mean 0 => deviation = |0.1 - 0| / 1
        let r = m.update(0.1);
        assert_eq!(r.mean, 0.0);
        assert!((r.deviation - 0.1).abs() < 1e-12);
        assert!(!r.drifted);
    }
}
