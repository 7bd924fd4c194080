//! Peak-based heart-rate estimation over the conditioned signal.
//!
//! A fixed-duration sliding window of filtered samples is scanned on each
//! detection cycle (default once per second of samples). A sample qualifies
//! as a peak if it exceeds the amplitude threshold and is strictly greater
//! than both immediate neighbors. Candidates inside the refractory period of
//! the previous accepted peak are rejected so one QRS complex is never
//! counted twice. The rate is `60 / mean(inter-peak interval)`. With fewer
//! than two qualifying peaks the cycle yields no estimate rather than a
//! fabricated one. The reported value is an unweighted moving average over
//! the last K accepted estimates.

use std::collections::VecDeque;

use crate::config::EstimatorSettings;

pub struct HeartRateEstimator {
    window: VecDeque<f64>,
    window_capacity: usize,
    sample_rate_hz: f64,
    threshold: f64,
    refractory_samples: usize,
    update_every: usize,
    since_detection: usize,
    estimates: VecDeque<f64>,
    smoothing: usize,
    current: Option<f64>,
}

impl HeartRateEstimator {
    pub fn new(est: &EstimatorSettings, sample_rate_hz: f64) -> Self {
        let window_capacity = ((est.window_secs * sample_rate_hz) as usize).max(3);
        Self {
            window: VecDeque::with_capacity(window_capacity),
            window_capacity,
            sample_rate_hz,
            threshold: est.peak_threshold_mv,
            refractory_samples: ((est.refractory_secs * sample_rate_hz) as usize).max(1),
            update_every: ((est.update_interval_secs * sample_rate_hz) as usize).max(1),
            since_detection: 0,
            estimates: VecDeque::with_capacity(est.smoothing),
            smoothing: est.smoothing.max(1),
            current: None,
        }
    }

    /// Feeds one filtered sample and returns the current smoothed estimate.
    ///
    /// Detection only runs once per update interval; between detection cycles
    /// the previous smoothed value is returned unchanged.
    pub fn observe(&mut self, filtered: f64) -> Option<f64> {
        if self.window.len() == self.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(filtered);

        self.since_detection += 1;
        if self.since_detection >= self.update_every {
            self.since_detection = 0;
            if let Some(rate) = self.window_rate() {
                if self.estimates.len() == self.smoothing {
                    self.estimates.pop_front();
                }
                self.estimates.push_back(rate);
                let sum: f64 = self.estimates.iter().sum();
                self.current = Some(sum / self.estimates.len() as f64);
            }
        }
        self.current
    }

    /// The smoothed estimate, or `None` while unavailable.
    pub fn current(&self) -> Option<f64> {
        self.current
    }

    /// One detection pass over the current window: peak picking plus the
    /// refractory constraint, then `60 / mean(interval)`. `None` when fewer
    /// than two qualifying peaks exist.
    pub fn window_rate(&self) -> Option<f64> {
        let samples: Vec<f64> = self.window.iter().copied().collect();
        if samples.len() < 3 {
            return None;
        }

        let mut peaks: Vec<usize> = Vec::new();
        for i in 1..samples.len() - 1 {
            let v = samples[i];
            if v <= self.threshold || v <= samples[i - 1] || v <= samples[i + 1] {
                continue;
            }
            if let Some(&last) = peaks.last() {
                if i - last < self.refractory_samples {
                    continue;
                }
            }
            peaks.push(i);
        }
        if peaks.len() < 2 {
            return None;
        }

        let total_samples = (peaks[peaks.len() - 1] - peaks[0]) as f64;
        let mean_interval_secs = total_samples / (peaks.len() - 1) as f64 / self.sample_rate_hz;
        Some(60.0 / mean_interval_secs)
    }

    /// Discards the window and all past estimates (fresh bring-up).
    pub fn reset(&mut self) {
        self.window.clear();
        self.estimates.clear();
        self.since_detection = 0;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorSettings;

    const FS: f64 = 500.0;

    fn estimator() -> HeartRateEstimator {
        HeartRateEstimator::new(&EstimatorSettings::default(), FS)
    }

    /// Unit spikes every `period` samples, zero elsewhere.
    fn spike_train(period: usize, n: usize) -> Vec<f64> {
        (0..n).map(|i| if i % period == 0 && i > 0 { 1.0 } else { 0.0 }).collect()
    }

    #[test]
    fn periodic_spikes_yield_expected_rate() {
        let mut e = estimator();
        // 0.8 s between spikes -> 75 bpm.
        for v in spike_train(400, 3000) {
            e.observe(v);
        }
        let rate = e.current().expect("rate should be available");
        assert!((rate - 75.0).abs() < 1.0, "expected ~75 bpm, got {rate}");
    }

    #[test]
    fn fewer_than_two_peaks_is_unavailable() {
        let mut e = estimator();
        for i in 0..1000 {
            e.observe(if i == 500 { 1.0 } else { 0.0 });
        }
        assert_eq!(e.window_rate(), None);
        assert_eq!(e.current(), None);
    }

    #[test]
    fn subthreshold_activity_is_ignored() {
        let mut e = estimator();
        for v in spike_train(400, 3000) {
            e.observe(v * 0.3); // below the 0.5 mV threshold
        }
        assert_eq!(e.current(), None);
    }

    #[test]
    fn refractory_rejects_double_counting() {
        // Each beat followed by a ringing artifact 100 ms later (well inside
        // the 300 ms refractory period).
        let mut e = estimator();
        let period = 400;
        for i in 0..3000usize {
            let phase = i % period;
            let v = match phase {
                10 => 1.0,
                60 => 0.9,
                _ => 0.0,
            };
            e.observe(v);
        }
        let rate = e.current().expect("rate should be available");
        assert!((rate - 75.0).abs() < 1.0, "ringing double-counted: got {rate}");
    }

    #[test]
    fn plateaus_are_not_peaks() {
        let mut e = estimator();
        // Flat-topped pulses: no sample strictly greater than both neighbors.
        for i in 0..3000usize {
            let phase = i % 400;
            e.observe(if (10..13).contains(&phase) { 1.0 } else { 0.0 });
        }
        assert_eq!(e.current(), None);
    }

    #[test]
    fn smoothing_window_is_bounded() {
        let settings = EstimatorSettings { smoothing: 3, ..Default::default() };
        let mut e = HeartRateEstimator::new(&settings, FS);
        for v in spike_train(400, 10_000) {
            e.observe(v);
        }
        assert!(e.estimates.len() <= 3);
        let rate = e.current().expect("rate should be available");
        assert!((rate - 75.0).abs() < 1.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut e = estimator();
        for v in spike_train(400, 3000) {
            e.observe(v);
        }
        assert!(e.current().is_some());
        e.reset();
        assert_eq!(e.current(), None);
        assert!(e.window.is_empty());
    }
}
