//! The conditioning pipeline: passband selection followed by a mains notch.
//!
//! Three second-order IIR stages from the `biquad` crate run in series: a
//! Butterworth high-pass at the lower passband edge, a Butterworth low-pass at
//! the upper edge, and a narrow notch at the mains frequency. The passband is
//! built from the high-pass/low-pass pair rather than a single band-pass
//! biquad because the single-biquad form has unity gain only at its center
//! frequency; the cascade holds the whole 0.5-40 Hz band near unity.
//!
//! Each stage carries its own state across calls. Streaming, not block-based.
//! Coefficients are derived once from the configured sample rate and filter
//! settings and are immutable afterward; the only reset is full
//! reinitialization, which zeroes all three state vectors.

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type, Q_BUTTERWORTH_F64};

use crate::config::FilterSettings;
use crate::error::{EcgError, EcgResult};

pub struct ConditioningPipeline {
    highpass: DirectForm1<f64>,
    lowpass: DirectForm1<f64>,
    notch: DirectForm1<f64>,
    highpass_coeffs: Coefficients<f64>,
    lowpass_coeffs: Coefficients<f64>,
    notch_coeffs: Coefficients<f64>,
}

impl ConditioningPipeline {
    /// Designs all three stages for the given sample rate.
    pub fn new(filters: &FilterSettings, sample_rate_hz: f64) -> EcgResult<Self> {
        let highpass_coeffs = Coefficients::<f64>::from_params(
            Type::HighPass,
            sample_rate_hz.hz(),
            filters.bandpass_low_hz.hz(),
            Q_BUTTERWORTH_F64,
        )
        .map_err(|_| EcgError::Config("invalid high-pass design parameters".into()))?;

        let lowpass_coeffs = Coefficients::<f64>::from_params(
            Type::LowPass,
            sample_rate_hz.hz(),
            filters.bandpass_high_hz.hz(),
            Q_BUTTERWORTH_F64,
        )
        .map_err(|_| EcgError::Config("invalid low-pass design parameters".into()))?;

        let notch_coeffs = Coefficients::<f64>::from_params(
            Type::Notch,
            sample_rate_hz.hz(),
            filters.notch_hz.hz(),
            filters.notch_q,
        )
        .map_err(|_| EcgError::Config("invalid notch design parameters".into()))?;

        Ok(Self {
            highpass: DirectForm1::<f64>::new(highpass_coeffs),
            lowpass: DirectForm1::<f64>::new(lowpass_coeffs),
            notch: DirectForm1::<f64>::new(notch_coeffs),
            highpass_coeffs,
            lowpass_coeffs,
            notch_coeffs,
        })
    }

    /// Runs one sample through all stages, in order. Called exactly once per
    /// accepted sample.
    pub fn process(&mut self, millivolts: f64) -> f64 {
        self.notch.run(self.lowpass.run(self.highpass.run(millivolts)))
    }

    /// Zeroes all state vectors. Coefficients are untouched.
    pub fn reset(&mut self) {
        self.highpass = DirectForm1::<f64>::new(self.highpass_coeffs);
        self.lowpass = DirectForm1::<f64>::new(self.lowpass_coeffs);
        self.notch = DirectForm1::<f64>::new(self.notch_coeffs);
    }
}
