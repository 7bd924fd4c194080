//! Configuration management.
//!
//! Settings are loaded from a TOML file (see `config/default.toml`) with
//! `ECG_DAQ_`-prefixed environment overrides, then validated. Every field has a
//! documented default, so a partial file (or none at all, via
//! [`Settings::default`]) is always usable. Register configuration values are
//! deliberately configuration inputs, not hard-coded constants: front-end board
//! revisions disagree on the "correct" table.

use crate::error::{EcgError, EcgResult};
use config::Config;
use serde::Deserialize;
use std::time::Duration;

/// Gains accepted by the front end's programmable gain amplifier.
pub const ALLOWED_GAINS: [u8; 7] = [1, 2, 3, 4, 6, 8, 12];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub hardware: HardwareSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub estimator: EstimatorSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
}

/// Front-end chip and timing parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct HardwareSettings {
    /// Target sample rate in Hz; the acquisition period is derived from this.
    #[serde(default = "defaults::sample_rate_hz")]
    pub sample_rate_hz: f64,
    /// Value expected in the identity register during bring-up.
    #[serde(default = "defaults::expected_device_id")]
    pub expected_device_id: u8,
    /// ADC reference voltage in millivolts (chip-internal reference by default).
    #[serde(default = "defaults::vref_millivolts")]
    pub vref_millivolts: f64,
    /// PGA gain applied to the primary channel. Must be in [`ALLOWED_GAINS`].
    #[serde(default = "defaults::gain")]
    pub gain: u8,
    /// Bring-up register table, applied in order through write-verify.
    #[serde(default = "defaults::registers")]
    pub registers: Vec<(u8, u8)>,
    /// How long the reset line is held low.
    #[serde(with = "humantime_serde", default = "defaults::reset_hold")]
    pub reset_hold: Duration,
    /// Settle time after releasing reset, before the chip accepts commands.
    #[serde(with = "humantime_serde", default = "defaults::reset_settle")]
    pub reset_settle: Duration,
}

/// Retry and degradation policy.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitSettings {
    /// Attempts per register in write-verify before giving up.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    /// Delay between write-verify attempts.
    #[serde(with = "humantime_serde", default = "defaults::retry_delay")]
    pub retry_delay: Duration,
    /// Data-ready wait bound, expressed in sample periods.
    #[serde(default = "defaults::drdy_timeout_cycles")]
    pub drdy_timeout_cycles: u32,
    /// Consecutive transient errors tolerated before the engine degrades.
    #[serde(default = "defaults::max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Samples whose absolute voltage exceeds this are dropped, not stored.
    #[serde(default = "defaults::max_abs_millivolts")]
    pub max_abs_millivolts: f64,
}

/// Conditioning pipeline design parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct FilterSettings {
    #[serde(default = "defaults::bandpass_low_hz")]
    pub bandpass_low_hz: f64,
    #[serde(default = "defaults::bandpass_high_hz")]
    pub bandpass_high_hz: f64,
    /// Mains interference frequency rejected by the notch stage.
    #[serde(default = "defaults::notch_hz")]
    pub notch_hz: f64,
    #[serde(default = "defaults::notch_q")]
    pub notch_q: f64,
}

/// Heart-rate estimator parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct EstimatorSettings {
    /// Length of the sliding peak-detection window, in seconds.
    #[serde(default = "defaults::window_secs")]
    pub window_secs: f64,
    /// Minimum amplitude for a sample to qualify as a candidate peak.
    #[serde(default = "defaults::peak_threshold_mv")]
    pub peak_threshold_mv: f64,
    /// Minimum spacing between accepted peaks.
    #[serde(default = "defaults::refractory_secs")]
    pub refractory_secs: f64,
    /// Depth of the moving average over accepted estimates.
    #[serde(default = "defaults::smoothing")]
    pub smoothing: usize,
    /// How often a detection cycle runs over the window, in seconds.
    #[serde(default = "defaults::update_interval_secs")]
    pub update_interval_secs: f64,
}

/// Telemetry ring capacity and signal-quality banding.
#[derive(Debug, Deserialize, Clone)]
pub struct BufferSettings {
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default = "defaults::weak_below_mv")]
    pub weak_below_mv: f64,
    #[serde(default = "defaults::saturated_above_mv")]
    pub saturated_above_mv: f64,
}

mod defaults {
    use std::time::Duration;

    pub fn sample_rate_hz() -> f64 {
        500.0
    }
    pub fn expected_device_id() -> u8 {
        0x73
    }
    pub fn vref_millivolts() -> f64 {
        2420.0
    }
    pub fn gain() -> u8 {
        6
    }
    /// CONFIG1 500 SPS, CONFIG2 reference on, CH1SET gain-6 normal input,
    /// CH2SET disabled, RLD_SENS right-leg drive enabled.
    pub fn registers() -> Vec<(u8, u8)> {
        vec![(0x01, 0x02), (0x02, 0xE0), (0x04, 0x00), (0x05, 0x00), (0x0E, 0x04)]
    }
    pub fn reset_hold() -> Duration {
        Duration::from_millis(100)
    }
    pub fn reset_settle() -> Duration {
        Duration::from_millis(100)
    }
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn retry_delay() -> Duration {
        Duration::from_millis(100)
    }
    pub fn drdy_timeout_cycles() -> u32 {
        10
    }
    pub fn max_consecutive_errors() -> u32 {
        10
    }
    pub fn max_abs_millivolts() -> f64 {
        450.0
    }
    pub fn bandpass_low_hz() -> f64 {
        0.5
    }
    pub fn bandpass_high_hz() -> f64 {
        40.0
    }
    pub fn notch_hz() -> f64 {
        50.0
    }
    pub fn notch_q() -> f64 {
        30.0
    }
    pub fn window_secs() -> f64 {
        10.0
    }
    pub fn peak_threshold_mv() -> f64 {
        0.5
    }
    pub fn refractory_secs() -> f64 {
        0.3
    }
    pub fn smoothing() -> usize {
        10
    }
    pub fn update_interval_secs() -> f64 {
        1.0
    }
    pub fn capacity() -> usize {
        2000
    }
    pub fn weak_below_mv() -> f64 {
        0.1
    }
    pub fn saturated_above_mv() -> f64 {
        2.0
    }
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: defaults::sample_rate_hz(),
            expected_device_id: defaults::expected_device_id(),
            vref_millivolts: defaults::vref_millivolts(),
            gain: defaults::gain(),
            registers: defaults::registers(),
            reset_hold: defaults::reset_hold(),
            reset_settle: defaults::reset_settle(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            retry_delay: defaults::retry_delay(),
            drdy_timeout_cycles: defaults::drdy_timeout_cycles(),
            max_consecutive_errors: defaults::max_consecutive_errors(),
            max_abs_millivolts: defaults::max_abs_millivolts(),
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            bandpass_low_hz: defaults::bandpass_low_hz(),
            bandpass_high_hz: defaults::bandpass_high_hz(),
            notch_hz: defaults::notch_hz(),
            notch_q: defaults::notch_q(),
        }
    }
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            window_secs: defaults::window_secs(),
            peak_threshold_mv: defaults::peak_threshold_mv(),
            refractory_secs: defaults::refractory_secs(),
            smoothing: defaults::smoothing(),
            update_interval_secs: defaults::update_interval_secs(),
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: defaults::capacity(),
            weak_below_mv: defaults::weak_below_mv(),
            saturated_above_mv: defaults::saturated_above_mv(),
        }
    }
}

impl Settings {
    /// Loads `config/{name}.toml` (default `config/default`) merged with
    /// `ECG_DAQ_`-prefixed environment variables, then validates.
    pub fn new(config_name: Option<&str>) -> EcgResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("ECG_DAQ").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The acquisition period derived from the configured sample rate.
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hardware.sample_rate_hz)
    }

    /// Semantic validation beyond what deserialization can express.
    pub fn validate(&self) -> EcgResult<()> {
        let hw = &self.hardware;
        if hw.sample_rate_hz <= 0.0 {
            return Err(EcgError::Config(format!(
                "sample_rate_hz must be positive, got {}",
                hw.sample_rate_hz
            )));
        }
        if !ALLOWED_GAINS.contains(&hw.gain) {
            return Err(EcgError::Config(format!(
                "gain {} not in supported set {:?}",
                hw.gain, ALLOWED_GAINS
            )));
        }
        if hw.vref_millivolts <= 0.0 {
            return Err(EcgError::Config("vref_millivolts must be positive".into()));
        }
        if hw.registers.is_empty() {
            return Err(EcgError::Config("bring-up register table is empty".into()));
        }
        if let Some((addr, _)) = hw.registers.iter().find(|(addr, _)| *addr > 0x7F) {
            return Err(EcgError::Config(format!(
                "register address 0x{addr:02X} exceeds the 7-bit address space"
            )));
        }

        let nyquist = hw.sample_rate_hz / 2.0;
        let f = &self.filters;
        if f.bandpass_low_hz <= 0.0 || f.bandpass_low_hz >= f.bandpass_high_hz {
            return Err(EcgError::Config(format!(
                "bandpass edges must satisfy 0 < low < high, got {}..{}",
                f.bandpass_low_hz, f.bandpass_high_hz
            )));
        }
        if f.bandpass_high_hz >= nyquist || f.notch_hz >= nyquist {
            return Err(EcgError::Config(format!(
                "filter frequencies must stay below Nyquist ({nyquist} Hz)"
            )));
        }
        if f.notch_q <= 0.0 {
            return Err(EcgError::Config("notch_q must be positive".into()));
        }

        let est = &self.estimator;
        if est.window_secs <= 0.0 || est.refractory_secs <= 0.0 {
            return Err(EcgError::Config(
                "estimator window and refractory period must be positive".into(),
            ));
        }
        if est.smoothing == 0 {
            return Err(EcgError::Config("estimator smoothing depth must be at least 1".into()));
        }

        if self.limits.max_attempts == 0 {
            return Err(EcgError::Config("max_attempts must be at least 1".into()));
        }
        if self.limits.max_consecutive_errors == 0 {
            return Err(EcgError::Config("max_consecutive_errors must be at least 1".into()));
        }
        if self.buffer.capacity == 0 {
            return Err(EcgError::Config("buffer capacity must be at least 1".into()));
        }
        Ok(())
    }
}
