//! Simulated front end for testing without physical hardware.
//!
//! `MockTransport` models just enough of an ADS1292R-style chip to exercise the
//! whole engine: a register file behind RREG/WREG opcodes, continuous-conversion
//! state driven by RDATAC/SDATAC and the START line, a data-ready pin, and
//! frame reads fed by a deterministic waveform closure (no RNG, so tests are
//! bit-for-bit repeatable).
//!
//! Fault injection covers every failure the error taxonomy names: outright
//! transfer failures, register read-back mismatches, bad-status frames, and a
//! stuck data-ready line. Per-register write/read counters let tests assert
//! exactly how many bus transactions a retry policy performed.

use std::collections::HashMap;

use crate::acquisition::{encode_code, millivolts_to_code};
use crate::config::HardwareSettings;
use crate::error::{EcgError, EcgResult};
use crate::transport::{BusTransport, Level, Pin};

const RREG: u8 = 0x20;
const WREG: u8 = 0x40;
const START: u8 = 0x08;
const STOP: u8 = 0x0A;
const RDATAC: u8 = 0x10;
const SDATAC: u8 = 0x11;

/// Status byte leading a healthy frame (nibble 0xC, per the chip's format).
pub const STATUS_OK: u8 = 0xC0;
/// Injected bad status: bus floating high reads back all-ones.
pub const STATUS_DISCONNECT: u8 = 0xFF;

const REGISTER_SPACE: usize = 0x20;

type Waveform = Box<dyn FnMut(u64) -> (f64, f64) + Send>;

/// Simulated bus + front-end chip.
pub struct MockTransport {
    device_id: u8,
    regs: [u8; REGISTER_SPACE],
    start_line: Level,
    reset_line: Level,
    cs_line: Level,
    rdatac: bool,
    sample_index: u64,
    waveform: Waveform,
    vref_millivolts: f64,
    gain: u8,

    // Fault injection.
    fail_transfers: u32,
    drdy_stuck_high: bool,
    bad_status_at: Vec<u64>,
    misreads: HashMap<u8, u32>,

    // Transaction counters for tests.
    reg_writes: HashMap<u8, u32>,
    reg_reads: HashMap<u8, u32>,
}

impl MockTransport {
    /// A mock whose identity, reference voltage, and gain match `hw`, streaming
    /// a flat zero waveform until [`set_waveform`](Self::set_waveform) is called.
    pub fn new(hw: &HardwareSettings) -> Self {
        let mut regs = [0u8; REGISTER_SPACE];
        regs[0] = hw.expected_device_id;
        Self {
            device_id: hw.expected_device_id,
            regs,
            start_line: Level::Low,
            reset_line: Level::High,
            cs_line: Level::High,
            rdatac: false,
            sample_index: 0,
            waveform: Box::new(|_| (0.0, 0.0)),
            vref_millivolts: hw.vref_millivolts,
            gain: hw.gain,
            fail_transfers: 0,
            drdy_stuck_high: false,
            bad_status_at: Vec::new(),
            misreads: HashMap::new(),
            reg_writes: HashMap::new(),
            reg_reads: HashMap::new(),
        }
    }

    /// Overrides the value the identity register reports (wrong-chip tests).
    pub fn with_device_id(mut self, id: u8) -> Self {
        self.device_id = id;
        self.regs[0] = id;
        self
    }

    /// Per-sample millivolt source for (primary, secondary) channels.
    pub fn set_waveform(&mut self, waveform: impl FnMut(u64) -> (f64, f64) + Send + 'static) {
        self.waveform = Box::new(waveform);
    }

    /// The next `n` transfers fail with a transport error.
    pub fn fail_next_transfers(&mut self, n: u32) {
        self.fail_transfers = n;
    }

    /// Hold the data-ready line deasserted regardless of streaming state.
    pub fn stall_data_ready(&mut self, stalled: bool) {
        self.drdy_stuck_high = stalled;
    }

    /// The frame at `sample_index` reads back with an all-ones status byte.
    pub fn inject_bad_status(&mut self, sample_index: u64) {
        self.bad_status_at.push(sample_index);
    }

    /// The next `count` reads of `addr` return a corrupted value, regardless
    /// of what was written.
    pub fn inject_misreads(&mut self, addr: u8, count: u32) {
        self.misreads.insert(addr, count);
    }

    /// Current value of a register in the simulated chip.
    pub fn register(&self, addr: u8) -> u8 {
        self.regs[addr as usize]
    }

    pub fn writes_to(&self, addr: u8) -> u32 {
        self.reg_writes.get(&addr).copied().unwrap_or(0)
    }

    pub fn reads_of(&self, addr: u8) -> u32 {
        self.reg_reads.get(&addr).copied().unwrap_or(0)
    }

    pub fn frames_read(&self) -> u64 {
        self.sample_index
    }

    /// Whether the chip is in continuous conversion (RDATAC + START asserted).
    pub fn is_streaming(&self) -> bool {
        self.rdatac && self.start_line == Level::High
    }

    fn power_on_reset(&mut self) {
        self.regs = [0u8; REGISTER_SPACE];
        self.regs[0] = self.device_id;
        self.rdatac = false;
        self.sample_index = 0;
    }

    fn command(&mut self, opcode: u8) -> EcgResult<()> {
        match opcode {
            RDATAC => self.rdatac = true,
            SDATAC => self.rdatac = false,
            // START/STOP opcodes mirror the line; the line is authoritative.
            START | STOP => {}
            other => {
                return Err(EcgError::Transport(format!(
                    "mock: unknown command opcode 0x{other:02X}"
                )))
            }
        }
        Ok(())
    }

    fn read_register_value(&mut self, addr: u8) -> u8 {
        *self.reg_reads.entry(addr).or_insert(0) += 1;
        let value = self.regs[addr as usize];
        if let Some(remaining) = self.misreads.get_mut(&addr) {
            if *remaining > 0 {
                *remaining -= 1;
                return !value;
            }
        }
        value
    }

    fn fill_frame(&mut self, buf: &mut [u8]) {
        let idx = self.sample_index;
        self.sample_index += 1;

        let status = if self.bad_status_at.contains(&idx) { STATUS_DISCONNECT } else { STATUS_OK };
        buf[0] = status;
        buf[1] = 0x00;
        buf[2] = 0x00;

        let (ch1_mv, ch2_mv) = (self.waveform)(idx);
        let ch1 = millivolts_to_code(ch1_mv, self.vref_millivolts, self.gain);
        let ch2 = millivolts_to_code(ch2_mv, self.vref_millivolts, self.gain);
        buf[3..6].copy_from_slice(&encode_code(ch1));
        buf[6..9].copy_from_slice(&encode_code(ch2));
    }
}

impl BusTransport for MockTransport {
    fn transfer(&mut self, buf: &mut [u8]) -> EcgResult<()> {
        if self.fail_transfers > 0 {
            self.fail_transfers -= 1;
            return Err(EcgError::Transport("mock: injected bus failure".into()));
        }
        match buf.len() {
            1 => self.command(buf[0]),
            3 if buf[0] & 0xE0 == WREG => {
                let addr = buf[0] & 0x1F;
                self.regs[addr as usize] = buf[2];
                *self.reg_writes.entry(addr).or_insert(0) += 1;
                Ok(())
            }
            3 if buf[0] & 0xE0 == RREG => {
                let addr = buf[0] & 0x1F;
                buf[2] = self.read_register_value(addr);
                Ok(())
            }
            9 => {
                self.fill_frame(buf);
                Ok(())
            }
            len => Err(EcgError::Transport(format!("mock: unsupported transfer length {len}"))),
        }
    }

    fn digital_read(&mut self, pin: Pin) -> EcgResult<Level> {
        match pin {
            Pin::DataReady => {
                if !self.drdy_stuck_high && self.is_streaming() {
                    // Active low: asserted means a frame is waiting.
                    Ok(Level::Low)
                } else {
                    Ok(Level::High)
                }
            }
            Pin::Start => Ok(self.start_line),
            Pin::Reset => Ok(self.reset_line),
            Pin::ChipSelect => Ok(self.cs_line),
        }
    }

    fn digital_write(&mut self, pin: Pin, level: Level) -> EcgResult<()> {
        match pin {
            Pin::Start => self.start_line = level,
            Pin::ChipSelect => self.cs_line = level,
            Pin::Reset => {
                let rising = self.reset_line == Level::Low && level == Level::High;
                self.reset_line = level;
                if rising {
                    self.power_on_reset();
                }
            }
            Pin::DataReady => {
                return Err(EcgError::Transport("mock: DRDY is an input pin".into()));
            }
        }
        Ok(())
    }
}

/// Clean sinusoid on the primary channel, flat secondary.
pub fn sine_millivolts(
    amplitude_mv: f64,
    freq_hz: f64,
    sample_rate_hz: f64,
) -> impl FnMut(u64) -> (f64, f64) + Send + 'static {
    move |idx| {
        let t = idx as f64 / sample_rate_hz;
        (amplitude_mv * (2.0 * std::f64::consts::PI * freq_hz * t).sin(), 0.0)
    }
}

/// Triangular pulse train at a fixed beat rate: a crude but deterministic
/// stand-in for an R-wave sequence.
pub fn pulse_train_millivolts(
    amplitude_mv: f64,
    bpm: f64,
    sample_rate_hz: f64,
) -> impl FnMut(u64) -> (f64, f64) + Send + 'static {
    let period = (60.0 / bpm * sample_rate_hz).round() as u64;
    let half_width = (sample_rate_hz * 0.02).max(1.0) as u64; // ~20 ms rise/fall
    move |idx| {
        let phase = idx % period.max(1);
        let value = if phase <= 2 * half_width {
            let distance = phase.abs_diff(half_width) as f64;
            amplitude_mv * (1.0 - distance / half_width as f64)
        } else {
            0.0
        };
        (value, 0.0)
    }
}
