//! The acquisition loop and its control surface.
//!
//! One engine instance owns the entire acquisition path end to end: the
//! register controller, the conditioning pipeline, the rate estimator, and the
//! writer side of the telemetry buffer. It is the sole writer of
//! [`AcquisitionState`] and of the rings; everything else observes through an
//! [`EngineHandle`], whose control commands are applied at cycle boundaries
//! rather than interrupting a frame in flight.
//!
//! The per-cycle logic lives in [`AcquisitionEngine::cycle`], which is public
//! so platform layers (and tests) with their own scheduler can drive the loop
//! deterministically; [`AcquisitionEngine::run`] wraps it with a fixed-cadence
//! `tokio::time::interval` derived from the configured sample rate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, ALLOWED_GAINS};
use crate::error::{EcgError, EcgResult};
use crate::processing::{ConditioningPipeline, HeartRateEstimator};
use crate::sensor::{self, SensorController};
use crate::telemetry::{Health, TelemetryBuffer, TelemetrySnapshot};
use crate::transport::BusTransport;

/// Positive full-scale code of the 24-bit converter.
pub const FULL_SCALE: i32 = 0x7F_FFFF;

/// Lifecycle of the acquisition path. Owned by the engine; everyone else
/// observes it through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Uninitialized,
    Resetting,
    Verifying,
    Configuring,
    Streaming,
    Degraded,
    Stopped,
}

/// One acquisition event. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Sign-extended 24-bit code, primary channel.
    pub raw: i32,
    /// Sign-extended 24-bit code, secondary channel (passthrough).
    pub raw_aux: i32,
    pub millivolts: f64,
    pub millivolts_aux: f64,
}

/// Coarse-grained control requests, observed at the next cycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    SetGain(u8),
}

/// Status block for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub state: AcquisitionState,
    pub sample_rate_hz: f64,
    pub buffer_depth: usize,
}

/// Decodes a big-endian 24-bit two's-complement code, sign-extended to i32.
pub fn decode_code(bytes: [u8; 3]) -> i32 {
    let value =
        ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | (bytes[2] as i32);
    (value << 8) >> 8
}

/// Encodes the low 24 bits of a code big-endian (inverse of [`decode_code`]).
pub fn encode_code(code: i32) -> [u8; 3] {
    let v = code & 0x00FF_FFFF;
    [(v >> 16) as u8, (v >> 8) as u8, v as u8]
}

/// `mV = code * vref / (gain * full_scale)`.
pub fn code_to_millivolts(code: i32, vref_millivolts: f64, gain: u8) -> f64 {
    code as f64 * vref_millivolts / (gain as f64 * FULL_SCALE as f64)
}

/// Inverse conversion, clamped to the converter's range. Used by simulated
/// front ends to synthesize codes.
pub fn millivolts_to_code(millivolts: f64, vref_millivolts: f64, gain: u8) -> i32 {
    let code = (millivolts * gain as f64 * FULL_SCALE as f64 / vref_millivolts).round();
    if code >= FULL_SCALE as f64 {
        FULL_SCALE
    } else if code <= -(FULL_SCALE as f64 + 1.0) {
        -FULL_SCALE - 1
    } else {
        code as i32
    }
}

/// A healthy frame leads with status nibble 0xC. All-ones means the bus is
/// floating (disconnect); anything else is a device fault. Both are transient.
pub fn validate_status(status: u8) -> EcgResult<()> {
    if status & 0xF0 == 0xC0 {
        Ok(())
    } else {
        Err(EcgError::DeviceFault { code: status })
    }
}

pub struct AcquisitionEngine<T: BusTransport> {
    sensor: SensorController<T>,
    pipeline: ConditioningPipeline,
    estimator: HeartRateEstimator,
    telemetry: Arc<TelemetryBuffer>,
    settings: Arc<Settings>,
    state: AcquisitionState,
    state_tx: watch::Sender<AcquisitionState>,
    commands: mpsc::Receiver<Command>,
    consecutive_errors: u32,
    gain: u8,
}

impl<T: BusTransport> AcquisitionEngine<T> {
    /// Builds the engine and its handle. Settings must already be validated.
    pub fn new(transport: T, settings: Settings) -> EcgResult<(Self, EngineHandle)> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let pipeline =
            ConditioningPipeline::new(&settings.filters, settings.hardware.sample_rate_hz)?;
        let estimator =
            HeartRateEstimator::new(&settings.estimator, settings.hardware.sample_rate_hz);
        let telemetry = Arc::new(TelemetryBuffer::new(&settings.buffer));
        let sensor = SensorController::new(transport, &settings.hardware, &settings.limits);

        let (state_tx, state_rx) = watch::channel(AcquisitionState::Uninitialized);
        let (command_tx, command_rx) = mpsc::channel(16);

        let handle = EngineHandle {
            commands: command_tx,
            state: state_rx,
            telemetry: Arc::clone(&telemetry),
            sample_rate_hz: settings.hardware.sample_rate_hz,
        };
        let engine = Self {
            sensor,
            pipeline,
            estimator,
            telemetry,
            gain: settings.hardware.gain,
            settings,
            state: AcquisitionState::Uninitialized,
            state_tx,
            commands: command_rx,
            consecutive_errors: 0,
        };
        Ok((engine, handle))
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Reset, identify, configure, in that order, fail-fast. On any failure
    /// the state is `Stopped` with the error retained in telemetry; the engine
    /// never exposes a partially configured device as ready.
    pub async fn bring_up(&mut self) -> EcgResult<()> {
        self.set_state(AcquisitionState::Resetting);
        match self.try_bring_up().await {
            Ok(()) => {
                self.pipeline.reset();
                self.estimator.reset();
                self.consecutive_errors = 0;
                self.telemetry.mark_bring_up();
                self.set_state(AcquisitionState::Stopped);
                info!("bring-up complete");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "bring-up failed");
                self.telemetry.record_terminal(&err);
                self.set_state(AcquisitionState::Stopped);
                Err(err)
            }
        }
    }

    async fn try_bring_up(&mut self) -> EcgResult<()> {
        self.sensor.reset().await?;
        self.set_state(AcquisitionState::Verifying);
        self.sensor.identify()?;
        self.set_state(AcquisitionState::Configuring);
        let table = self.register_table()?;
        self.sensor.configure(&table).await?;
        Ok(())
    }

    /// The configured bring-up table with the gain field of CH1SET rewritten
    /// to match the configured gain.
    fn register_table(&self) -> EcgResult<Vec<(u8, u8)>> {
        let bits = sensor::gain_bits(self.gain)?;
        Ok(self
            .settings
            .hardware
            .registers
            .iter()
            .map(|&(addr, value)| {
                if addr == sensor::regs::CH1SET {
                    (addr, (value & !0x70) | bits)
                } else {
                    (addr, value)
                }
            })
            .collect())
    }

    /// Enters streaming. No-op if already streaming; refuses if the bring-up
    /// table is not fully known-good.
    pub fn start_streaming(&mut self) -> EcgResult<()> {
        if self.state == AcquisitionState::Streaming {
            return Ok(());
        }
        if !self.sensor.is_configured() {
            return Err(EcgError::NotRunning);
        }
        self.sensor.start_continuous()?;
        self.telemetry.mark_started();
        self.consecutive_errors = 0;
        self.set_state(AcquisitionState::Streaming);
        info!(sample_rate_hz = self.settings.hardware.sample_rate_hz, "streaming started");
        Ok(())
    }

    /// Cooperative stop: drops the START line at the current cycle boundary.
    pub fn stop_streaming(&mut self) -> EcgResult<()> {
        if self.state == AcquisitionState::Streaming {
            self.sensor.stop_continuous()?;
            self.set_state(AcquisitionState::Stopped);
            info!("streaming stopped");
        }
        Ok(())
    }

    /// Applies a new PGA gain through write-verify. A failed write leaves the
    /// channel configuration unknown, so the engine drops back to `Stopped`
    /// and requires a fresh bring-up.
    pub async fn set_gain(&mut self, gain: u8) -> EcgResult<()> {
        if !ALLOWED_GAINS.contains(&gain) {
            return Err(EcgError::InvalidGain { requested: gain });
        }
        match self.sensor.set_gain(gain).await {
            Ok(()) => {
                self.gain = gain;
                info!(gain, "gain updated");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "gain update failed");
                self.telemetry.record_terminal(&err);
                let _ = self.sensor.stop_continuous();
                self.set_state(AcquisitionState::Stopped);
                Err(err)
            }
        }
    }

    /// One scheduled cycle, including the transient-error policy.
    ///
    /// Returns `Ok` for a delivered sample and for tolerated transient errors
    /// below the threshold. The degradation transition is surfaced exactly
    /// once, as `Err(Degraded)`; afterwards the engine refuses to cycle until
    /// a fresh bring-up.
    pub async fn cycle(&mut self) -> EcgResult<()> {
        if self.state != AcquisitionState::Streaming {
            return Err(EcgError::NotRunning);
        }
        match self.run_cycle().await {
            Ok(sample) => {
                self.consecutive_errors = 0;
                debug!(mv = sample.millivolts, "sample acquired");
                Ok(())
            }
            Err(err) if err.is_transient() => {
                self.consecutive_errors += 1;
                warn!(
                    error = %err,
                    consecutive = self.consecutive_errors,
                    "transient acquisition error"
                );
                self.telemetry.record_transient(&err);
                if self.consecutive_errors >= self.settings.limits.max_consecutive_errors {
                    self.enter_degraded()
                } else {
                    Ok(())
                }
            }
            Err(err) => {
                // The bus itself failed mid-stream; no point counting.
                error!(error = %err, "fatal acquisition error");
                self.telemetry.record_terminal(&err);
                self.enter_degraded()
            }
        }
    }

    fn enter_degraded(&mut self) -> EcgResult<()> {
        let err = EcgError::Degraded { consecutive: self.consecutive_errors };
        error!(error = %err, "halting acquisition");
        self.telemetry.record_terminal(&err);
        let _ = self.sensor.stop_continuous();
        self.set_state(AcquisitionState::Degraded);
        Err(err)
    }

    async fn run_cycle(&mut self) -> EcgResult<Sample> {
        self.wait_data_ready().await?;
        let frame = self.sensor.read_frame()?;
        validate_status(frame[0])?;
        let sample = self.convert_frame(&frame)?;

        let filtered = self.pipeline.process(sample.millivolts);
        let rate = self.estimator.observe(filtered);
        self.telemetry.push(sample.millivolts, filtered);
        self.telemetry.set_rate(rate);
        Ok(sample)
    }

    fn convert_frame(&self, frame: &[u8]) -> EcgResult<Sample> {
        let hw = &self.settings.hardware;
        let raw = decode_code([frame[3], frame[4], frame[5]]);
        let raw_aux = decode_code([frame[6], frame[7], frame[8]]);
        let millivolts = code_to_millivolts(raw, hw.vref_millivolts, self.gain);
        if millivolts.abs() > self.settings.limits.max_abs_millivolts {
            return Err(EcgError::ValueOutOfRange { millivolts });
        }
        Ok(Sample {
            timestamp: Utc::now(),
            raw,
            raw_aux,
            millivolts,
            millivolts_aux: code_to_millivolts(raw_aux, hw.vref_millivolts, self.gain),
        })
    }

    /// Bounded wait for the data-ready line: polls at a tenth of the sample
    /// period, gives up after `drdy_timeout_cycles` periods.
    async fn wait_data_ready(&mut self) -> EcgResult<()> {
        let period = self.settings.sample_period();
        let timeout = period * self.settings.limits.drdy_timeout_cycles;
        let poll = std::cmp::max(period / 10, Duration::from_micros(100));
        let mut waited = Duration::ZERO;
        loop {
            if self.sensor.data_ready()? {
                return Ok(());
            }
            if waited >= timeout {
                return Err(EcgError::DataReadyTimeout);
            }
            sleep(poll).await;
            waited += poll;
        }
    }

    fn set_state(&mut self, state: AcquisitionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                if self.state == AcquisitionState::Streaming {
                    return; // idempotent
                }
                let needs_bring_up =
                    !self.sensor.is_configured() || self.state == AcquisitionState::Degraded;
                if needs_bring_up && self.bring_up().await.is_err() {
                    return; // error already recorded and state set
                }
                if let Err(err) = self.start_streaming() {
                    warn!(error = %err, "start refused");
                }
            }
            Command::Stop => {
                if let Err(err) = self.stop_streaming() {
                    warn!(error = %err, "stop failed");
                }
            }
            Command::SetGain(gain) => {
                let _ = self.set_gain(gain).await;
            }
        }
    }

    /// Drives the loop at the configured cadence until every handle is
    /// dropped. While not streaming the task parks on the command channel;
    /// while streaming it ticks, drains pending commands, then runs one cycle.
    pub async fn run(mut self) {
        let period = self.settings.sample_period();
        let mut ticker: Option<Interval> = None;
        'task: loop {
            if self.state != AcquisitionState::Streaming {
                ticker = None;
                let Some(cmd) = self.commands.recv().await else { break };
                self.apply_command(cmd).await;
                continue;
            }
            let tick = ticker.get_or_insert_with(|| {
                let mut i = interval(period);
                i.set_missed_tick_behavior(MissedTickBehavior::Delay);
                i
            });
            tick.tick().await;

            // Control is observed at the cycle boundary, never mid-frame.
            // A disconnected channel means every handle is gone.
            loop {
                match self.commands.try_recv() {
                    Ok(cmd) => self.apply_command(cmd).await,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'task,
                }
            }
            if self.state != AcquisitionState::Streaming {
                continue;
            }
            // The degradation transition was already recorded and surfaced.
            let _ = self.cycle().await;
        }
        let _ = self.sensor.stop_continuous();
        debug!("acquisition task exiting");
    }

    /// Reads back the known-good registers, for debug surfaces.
    pub fn dump_registers(&mut self) -> EcgResult<std::collections::BTreeMap<u8, u8>> {
        self.sensor.dump_registers()
    }

    /// Direct access to the register controller (teardown, debug, tests).
    pub fn sensor_mut(&mut self) -> &mut SensorController<T> {
        &mut self.sensor
    }

    pub fn telemetry(&self) -> Arc<TelemetryBuffer> {
        Arc::clone(&self.telemetry)
    }
}

impl<T: BusTransport + 'static> AcquisitionEngine<T> {
    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Clonable control and telemetry surface for the presentation layer.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<AcquisitionState>,
    telemetry: Arc<TelemetryBuffer>,
    sample_rate_hz: f64,
}

impl EngineHandle {
    pub async fn start(&self) -> EcgResult<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> EcgResult<()> {
        self.send(Command::Stop).await
    }

    /// Requests a gain change. Rejects values outside the supported set
    /// before anything reaches the acquisition task.
    pub async fn set_gain(&self, gain: u8) -> EcgResult<()> {
        if !ALLOWED_GAINS.contains(&gain) {
            return Err(EcgError::InvalidGain { requested: gain });
        }
        self.send(Command::SetGain(gain)).await
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// A watch receiver for callers that want to await state changes.
    pub fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state.clone()
    }

    pub fn get_status(&self) -> EngineStatus {
        let state = self.state();
        EngineStatus {
            running: state == AcquisitionState::Streaming,
            state,
            sample_rate_hz: self.sample_rate_hz,
            buffer_depth: self.telemetry.len(),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn snapshot_tail(&self, n: usize) -> TelemetrySnapshot {
        self.telemetry.snapshot_tail(n)
    }

    pub fn current_rate(&self) -> Option<f64> {
        self.telemetry.current_rate()
    }

    pub fn health(&self) -> Health {
        self.telemetry.health()
    }

    async fn send(&self, cmd: Command) -> EcgResult<()> {
        self.commands.send(cmd).await.map_err(|_| EcgError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SignalQuality;
    use crate::transport::mock::{sine_millivolts, MockTransport};

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.limits.retry_delay = Duration::from_millis(0);
        settings
    }

    fn engine_with(
        configure: impl FnOnce(&mut MockTransport),
    ) -> (AcquisitionEngine<MockTransport>, EngineHandle) {
        let settings = fast_settings();
        let mut transport = MockTransport::new(&settings.hardware);
        configure(&mut transport);
        AcquisitionEngine::new(transport, settings).expect("engine construction")
    }

    #[test]
    fn twos_complement_round_trip() {
        for code in [0, 1, -1, 4660, -292, FULL_SCALE, -FULL_SCALE - 1] {
            assert_eq!(decode_code(encode_code(code)), code);
        }
        // Boundary patterns from the converter's data sheet.
        assert_eq!(decode_code([0x80, 0x00, 0x00]), -(1 << 23));
        assert_eq!(decode_code([0x7F, 0xFF, 0xFF]), FULL_SCALE);
        assert_eq!(decode_code([0xFF, 0xFF, 0xFF]), -1);
    }

    #[test]
    fn conversion_uses_gain_and_reference() {
        // Full-scale code maps to vref/gain.
        let mv = code_to_millivolts(FULL_SCALE, 2420.0, 6);
        assert!((mv - 2420.0 / 6.0).abs() < 1e-9);
        assert_eq!(millivolts_to_code(0.0, 2420.0, 6), 0);
        let round = code_to_millivolts(millivolts_to_code(1.5, 2420.0, 6), 2420.0, 6);
        assert!((round - 1.5).abs() < 1e-3);
    }

    #[test]
    fn status_validation() {
        assert!(validate_status(0xC0).is_ok());
        assert!(validate_status(0xC5).is_ok());
        assert!(matches!(validate_status(0xFF), Err(EcgError::DeviceFault { code: 0xFF })));
        assert!(matches!(validate_status(0x00), Err(EcgError::DeviceFault { code: 0x00 })));
    }

    #[tokio::test(start_paused = true)]
    async fn bring_up_reaches_stopped_ready() {
        let (mut engine, _handle) = engine_with(|_| {});
        engine.bring_up().await.unwrap();
        assert_eq!(engine.state(), AcquisitionState::Stopped);
        assert!(engine.sensor_mut().is_configured());
        assert!(engine.telemetry().health().bus_ok);
    }

    #[tokio::test(start_paused = true)]
    async fn bring_up_fails_on_wrong_identity() {
        let settings = fast_settings();
        let transport = MockTransport::new(&settings.hardware).with_device_id(0x12);
        let (mut engine, _handle) =
            AcquisitionEngine::new(transport, settings).expect("engine construction");
        let err = engine.bring_up().await.unwrap_err();
        assert!(matches!(err, EcgError::UnexpectedIdentity { expected: 0x73, got: 0x12 }));
        assert_eq!(engine.state(), AcquisitionState::Stopped);
        // Error retained for inspection.
        assert!(engine.telemetry().health().last_error.unwrap().contains("0x12"));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_acquires_and_conditions_samples() {
        let (mut engine, handle) = engine_with(|t| {
            t.set_waveform(sine_millivolts(1.0, 10.0, 500.0));
        });
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        for _ in 0..200 {
            engine.cycle().await.unwrap();
        }
        let snap = handle.snapshot();
        assert_eq!(snap.raw.len(), 200);
        assert_eq!(snap.filtered.len(), 200);
        assert_eq!(snap.health.samples_acquired, 200);
        // Quality tracks the last sample, which may sit anywhere in the sine
        // phase; a live in-band signal is Weak or Nominal, never NoSignal.
        assert!(matches!(
            snap.health.signal_quality,
            SignalQuality::Weak | SignalQuality::Nominal
        ));
        assert!(snap.filtered.iter().any(|v| v.abs() > 0.1), "no nominal-band samples seen");
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_is_a_no_op() {
        let (mut engine, _handle) = engine_with(|_| {});
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        engine.start_streaming().unwrap();
        assert_eq!(engine.state(), AcquisitionState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_bring_up_is_refused() {
        let (mut engine, _handle) = engine_with(|_| {});
        assert!(matches!(engine.start_streaming(), Err(EcgError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_timeouts_degrade_exactly_once() {
        let (mut engine, _handle) = engine_with(|t| t.stall_data_ready(true));
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();

        let threshold = engine.settings.limits.max_consecutive_errors;
        for _ in 0..threshold - 1 {
            engine.cycle().await.unwrap(); // tolerated
            assert_eq!(engine.state(), AcquisitionState::Streaming);
        }
        let err = engine.cycle().await.unwrap_err();
        assert!(matches!(err, EcgError::Degraded { consecutive } if consecutive == threshold));
        assert_eq!(engine.state(), AcquisitionState::Degraded);
        assert!(!engine.sensor_mut().transport_mut().is_streaming());

        // Further cycles are refused; no samples were pushed.
        assert!(matches!(engine.cycle().await, Err(EcgError::NotRunning)));
        assert_eq!(engine.telemetry().len(), 0);
        assert_eq!(engine.telemetry().health().transient_errors, threshold as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_mid_stream_degrades_immediately() {
        let (mut engine, _handle) = engine_with(|_| {});
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        engine.cycle().await.unwrap();

        engine.sensor_mut().transport_mut().fail_next_transfers(1);
        let err = engine.cycle().await.unwrap_err();
        assert!(matches!(err, EcgError::Degraded { .. }));
        assert_eq!(engine.state(), AcquisitionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_sample_is_dropped_not_stored() {
        // Plausibility bound tightened below the converter's full scale so a
        // railed input (clamped to full scale, ~403 mV at gain 6) trips it.
        let mut settings = fast_settings();
        settings.limits.max_abs_millivolts = 100.0;
        let mut transport = MockTransport::new(&settings.hardware);
        transport.set_waveform(|_| (10_000.0, 0.0));
        let (mut engine, _handle) =
            AcquisitionEngine::new(transport, settings).expect("engine construction");
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        engine.cycle().await.unwrap(); // tolerated transient
        assert_eq!(engine.telemetry().len(), 0);
        assert_eq!(engine.telemetry().health().transient_errors, 1);
        assert_eq!(engine.state(), AcquisitionState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_degraded_requires_bring_up() {
        let (mut engine, _handle) = engine_with(|t| t.stall_data_ready(true));
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        for _ in 0..engine.settings.limits.max_consecutive_errors {
            let _ = engine.cycle().await;
        }
        assert_eq!(engine.state(), AcquisitionState::Degraded);

        // Fresh bring-up clears the fault and streaming resumes.
        engine.sensor_mut().transport_mut().stall_data_ready(false);
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        engine.cycle().await.unwrap();
        assert_eq!(engine.state(), AcquisitionState::Streaming);
        assert_eq!(engine.telemetry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_gain_write_forces_fresh_bring_up() {
        let (mut engine, _handle) = engine_with(|_| {});
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        engine.sensor_mut().transport_mut().inject_misreads(sensor::regs::CH1SET, 100);

        let err = engine.set_gain(12).await.unwrap_err();
        assert!(matches!(err, EcgError::RegisterVerifyFailed { .. }));
        assert_eq!(engine.state(), AcquisitionState::Stopped);
        assert!(!engine.sensor_mut().is_configured());
        // Streaming is refused until the table is re-verified.
        assert!(matches!(engine.start_streaming(), Err(EcgError::NotRunning)));

        engine.sensor_mut().transport_mut().inject_misreads(sensor::regs::CH1SET, 0);
        engine.bring_up().await.unwrap();
        engine.start_streaming().unwrap();
        engine.cycle().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handle_rejects_unsupported_gain_locally() {
        let (_engine, handle) = engine_with(|_| {});
        assert!(matches!(
            handle.set_gain(7).await,
            Err(EcgError::InvalidGain { requested: 7 })
        ));
    }
}
