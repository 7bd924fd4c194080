//! Bounded telemetry rings and the health surface.
//!
//! The acquisition task is the sole writer; consumers read through copy-out
//! snapshots. All mutable state sits behind one `std::sync::Mutex` held only
//! for the duration of a push or a copy, so the producer never blocks on a
//! consumer.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BufferSettings;
use crate::error::EcgError;

/// Three-way banding of the conditioned signal, recomputed every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    /// No samples have been produced yet (or the engine is stopped).
    NoSignal,
    Weak,
    Nominal,
    Saturated,
}

/// Health flags maintained alongside every push.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub last_error: Option<String>,
    pub bus_ok: bool,
    pub signal_quality: SignalQuality,
    pub transient_errors: u64,
    pub samples_acquired: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            last_error: None,
            bus_ok: false,
            signal_quality: SignalQuality::NoSignal,
            transient_errors: 0,
            samples_acquired: 0,
            started_at: None,
        }
    }
}

/// Consistent copy-out view handed to consumers; never mutated after handoff.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Raw (converted, unconditioned) millivolts, oldest first.
    pub raw: Vec<f64>,
    /// Conditioned millivolts, oldest first.
    pub filtered: Vec<f64>,
    /// Smoothed heart rate in bpm, if available.
    pub heart_rate: Option<f64>,
    pub health: Health,
}

struct Inner {
    raw: VecDeque<f64>,
    filtered: VecDeque<f64>,
    heart_rate: Option<f64>,
    health: Health,
}

/// Fixed-capacity ring buffers plus the latest rate and health flags.
pub struct TelemetryBuffer {
    capacity: usize,
    weak_below_mv: f64,
    saturated_above_mv: f64,
    inner: Mutex<Inner>,
}

impl TelemetryBuffer {
    pub fn new(buffer: &BufferSettings) -> Self {
        Self {
            capacity: buffer.capacity.max(1),
            weak_below_mv: buffer.weak_below_mv,
            saturated_above_mv: buffer.saturated_above_mv,
            inner: Mutex::new(Inner {
                raw: VecDeque::with_capacity(buffer.capacity),
                filtered: VecDeque::with_capacity(buffer.capacity),
                heart_rate: None,
                health: Health::default(),
            }),
        }
    }

    fn classify(&self, millivolts: f64) -> SignalQuality {
        let magnitude = millivolts.abs();
        if magnitude < self.weak_below_mv {
            SignalQuality::Weak
        } else if magnitude > self.saturated_above_mv {
            SignalQuality::Saturated
        } else {
            SignalQuality::Nominal
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-push; the data is still the best
        // available, so recover rather than cascade the panic into readers.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// O(1) append of one sample pair; overwrites the oldest entry once full.
    /// Signal quality and counters are updated under the same lock.
    pub fn push(&self, raw_mv: f64, filtered_mv: f64) {
        let quality = self.classify(filtered_mv);
        let mut inner = self.lock();
        if inner.raw.len() == self.capacity {
            inner.raw.pop_front();
        }
        inner.raw.push_back(raw_mv);
        if inner.filtered.len() == self.capacity {
            inner.filtered.pop_front();
        }
        inner.filtered.push_back(filtered_mv);
        inner.health.signal_quality = quality;
        inner.health.samples_acquired += 1;
        inner.health.bus_ok = true;
    }

    /// Publishes the latest smoothed rate estimate.
    pub fn set_rate(&self, rate: Option<f64>) {
        self.lock().heart_rate = rate;
    }

    /// Records a tolerated in-loop error.
    pub fn record_transient(&self, err: &EcgError) {
        let mut inner = self.lock();
        inner.health.transient_errors += 1;
        inner.health.last_error = Some(err.to_string());
        if matches!(err, EcgError::Transport(_)) {
            inner.health.bus_ok = false;
        }
    }

    /// Records a terminal error (bring-up failure or degradation).
    pub fn record_terminal(&self, err: &EcgError) {
        let mut inner = self.lock();
        inner.health.last_error = Some(err.to_string());
        inner.health.bus_ok = false;
        inner.health.signal_quality = SignalQuality::NoSignal;
    }

    /// Marks a successful bring-up: the bus is alive, the error slate clean.
    pub fn mark_bring_up(&self) {
        let mut inner = self.lock();
        inner.health.bus_ok = true;
        inner.health.last_error = None;
    }

    /// Stamps the start of a streaming session.
    pub fn mark_started(&self) {
        self.lock().health.started_at = Some(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.lock().raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full copy-out snapshot, safe to read after the call returns.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let inner = self.lock();
        TelemetrySnapshot {
            raw: inner.raw.iter().copied().collect(),
            filtered: inner.filtered.iter().copied().collect(),
            heart_rate: inner.heart_rate,
            health: inner.health.clone(),
        }
    }

    /// Only the most recent `n` elements of each ring, for lightweight polling.
    pub fn snapshot_tail(&self, n: usize) -> TelemetrySnapshot {
        let inner = self.lock();
        let tail = |ring: &VecDeque<f64>| -> Vec<f64> {
            ring.iter().skip(ring.len().saturating_sub(n)).copied().collect()
        };
        TelemetrySnapshot {
            raw: tail(&inner.raw),
            filtered: tail(&inner.filtered),
            heart_rate: inner.heart_rate,
            health: inner.health.clone(),
        }
    }

    pub fn current_rate(&self) -> Option<f64> {
        self.lock().heart_rate
    }

    pub fn health(&self) -> Health {
        self.lock().health.clone()
    }
}
