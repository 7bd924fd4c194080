//! Register controller for the biopotential front end.
//!
//! Owns the transport during bring-up and implements the chip's register
//! protocol: hardware reset, identity check, write-with-verify, the ordered
//! configuration sequence, and the continuous-conversion start/stop commands.
//!
//! Every configuration register goes through [`SensorController::write_verify`];
//! there are no bare writes. Registers that verified successfully are tracked
//! in the known-good map, and the acquisition loop refuses to stream until the
//! whole bring-up table is known-good.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{HardwareSettings, LimitSettings, ALLOWED_GAINS};
use crate::error::{EcgError, EcgResult};
use crate::transport::{BusTransport, Level, Pin};

/// Register addresses used by the bring-up and control paths.
pub mod regs {
    /// Identity register; reads a fixed chip ID.
    pub const ID: u8 = 0x00;
    pub const CONFIG1: u8 = 0x01;
    pub const CONFIG2: u8 = 0x02;
    /// Primary channel settings; the PGA gain field lives in bits 6:4.
    pub const CH1SET: u8 = 0x04;
    pub const CH2SET: u8 = 0x05;
    pub const RLD_SENS: u8 = 0x0E;
}

/// Serial opcodes.
mod cmd {
    pub const START: u8 = 0x08;
    pub const STOP: u8 = 0x0A;
    pub const RDATAC: u8 = 0x10;
    pub const SDATAC: u8 = 0x11;
    pub const RREG: u8 = 0x20;
    pub const WREG: u8 = 0x40;
}

/// Size of one continuous-mode frame: 3 status bytes + 2 x 24-bit channels.
pub const FRAME_LEN: usize = 9;

/// PGA gain bit-field for CH1SET (bits 6:4).
pub fn gain_bits(gain: u8) -> EcgResult<u8> {
    let bits = match gain {
        6 => 0b000,
        1 => 0b001,
        2 => 0b010,
        3 => 0b011,
        4 => 0b100,
        8 => 0b101,
        12 => 0b110,
        other => return Err(EcgError::InvalidGain { requested: other }),
    };
    Ok(bits << 4)
}

pub struct SensorController<T: BusTransport> {
    transport: T,
    expected_device_id: u8,
    reset_hold: Duration,
    reset_settle: Duration,
    retry_delay: Duration,
    max_attempts: u32,
    /// Registers written and read back successfully this bring-up.
    known_good: BTreeMap<u8, u8>,
    configured: bool,
    streaming: bool,
}

impl<T: BusTransport> SensorController<T> {
    pub fn new(transport: T, hw: &HardwareSettings, limits: &LimitSettings) -> Self {
        Self {
            transport,
            expected_device_id: hw.expected_device_id,
            reset_hold: hw.reset_hold,
            reset_settle: hw.reset_settle,
            retry_delay: limits.retry_delay,
            max_attempts: limits.max_attempts,
            known_good: BTreeMap::new(),
            configured: false,
            streaming: false,
        }
    }

    /// Whether the full bring-up table has been verified since the last reset.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Registers verified during the current bring-up, by address.
    pub fn known_good(&self) -> &BTreeMap<u8, u8> {
        &self.known_good
    }

    /// Hardware reset: drive the reset line low, hold, release, settle.
    ///
    /// Only the transport can fail here; there is no protocol involved.
    pub async fn reset(&mut self) -> EcgResult<()> {
        debug!(hold_ms = self.reset_hold.as_millis() as u64, "resetting front end");
        self.known_good.clear();
        self.configured = false;
        self.streaming = false;
        self.transport.digital_write(Pin::Reset, Level::Low)?;
        sleep(self.reset_hold).await;
        self.transport.digital_write(Pin::Reset, Level::High)?;
        sleep(self.reset_settle).await;
        // Leave continuous-read mode in case the chip powered up in it.
        self.send_command(cmd::SDATAC)?;
        Ok(())
    }

    /// Reads the identity register and checks it against the expected chip ID.
    pub fn identify(&mut self) -> EcgResult<u8> {
        let id = self.read_register(regs::ID)?;
        if id != self.expected_device_id {
            return Err(EcgError::UnexpectedIdentity { expected: self.expected_device_id, got: id });
        }
        info!(id = format_args!("0x{id:02X}"), "front end identified");
        Ok(id)
    }

    /// Writes a register and reads it back, retrying up to `max_attempts`
    /// with a fixed delay between attempts. Succeeds only on exact match.
    pub async fn write_verify(&mut self, addr: u8, value: u8, max_attempts: u32) -> EcgResult<()> {
        let mut last_read = value;
        for attempt in 1..=max_attempts.max(1) {
            self.write_register(addr, value)?;
            last_read = self.read_register(addr)?;
            if last_read == value {
                self.known_good.insert(addr, value);
                return Ok(());
            }
            warn!(
                addr = format_args!("0x{addr:02X}"),
                attempt, max_attempts, "register read-back mismatch"
            );
            if attempt < max_attempts {
                sleep(self.retry_delay).await;
            }
        }
        Err(EcgError::RegisterVerifyFailed { addr, expected: value, got: last_read })
    }

    /// Applies the bring-up table in order, fail-fast: the first register that
    /// cannot be verified aborts the sequence and surfaces its address.
    pub async fn configure(&mut self, register_values: &[(u8, u8)]) -> EcgResult<()> {
        for &(addr, value) in register_values {
            self.write_verify(addr, value, self.max_attempts).await?;
        }
        self.configured = true;
        info!(registers = register_values.len(), "front end configured");
        Ok(())
    }

    /// Enters continuous conversion: RDATAC opcode plus the START line.
    /// Calling while already streaming is a no-op.
    pub fn start_continuous(&mut self) -> EcgResult<()> {
        if self.streaming {
            return Ok(());
        }
        self.send_command(cmd::RDATAC)?;
        self.send_command(cmd::START)?;
        self.transport.digital_write(Pin::Start, Level::High)?;
        self.streaming = true;
        Ok(())
    }

    /// Leaves continuous conversion and drops the START line. Idempotent.
    pub fn stop_continuous(&mut self) -> EcgResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.send_command(cmd::SDATAC)?;
        self.send_command(cmd::STOP)?;
        self.transport.digital_write(Pin::Start, Level::Low)?;
        self.streaming = false;
        Ok(())
    }

    /// Rewrites the primary channel's gain field through write-verify,
    /// pausing continuous conversion around the write if necessary.
    pub async fn set_gain(&mut self, gain: u8) -> EcgResult<()> {
        let bits = gain_bits(gain)?;
        let was_streaming = self.streaming;
        if was_streaming {
            self.stop_continuous()?;
        }
        let current = self.known_good.get(&regs::CH1SET).copied().unwrap_or(0);
        let value = (current & !0x70) | bits;
        let result = self.write_verify(regs::CH1SET, value, self.max_attempts).await;
        if result.is_err() {
            // The channel register contents are unknown now; streaming must
            // not resume until a fresh bring-up re-verifies the table.
            self.known_good.remove(&regs::CH1SET);
            self.configured = false;
            return result;
        }
        if was_streaming {
            self.start_continuous()?;
        }
        result
    }

    /// Reads back every register in the known-good set, for debug surfaces.
    /// Does not modify the known-good map.
    pub fn dump_registers(&mut self) -> EcgResult<BTreeMap<u8, u8>> {
        let addrs: Vec<u8> = self.known_good.keys().copied().collect();
        let mut out = BTreeMap::new();
        for addr in addrs {
            out.insert(addr, self.read_register(addr)?);
        }
        Ok(out)
    }

    /// Whether the data-ready line is asserted (active low).
    pub fn data_ready(&mut self) -> EcgResult<bool> {
        Ok(self.transport.digital_read(Pin::DataReady)?.is_low())
    }

    /// Reads one continuous-mode frame.
    pub fn read_frame(&mut self) -> EcgResult<[u8; FRAME_LEN]> {
        let mut frame = [0u8; FRAME_LEN];
        self.transport.digital_write(Pin::ChipSelect, Level::Low)?;
        let result = self.transport.transfer(&mut frame);
        self.transport.digital_write(Pin::ChipSelect, Level::High)?;
        result?;
        Ok(frame)
    }

    /// Access to the transport for teardown or tests.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn send_command(&mut self, opcode: u8) -> EcgResult<()> {
        let mut buf = [opcode];
        self.transport.digital_write(Pin::ChipSelect, Level::Low)?;
        let result = self.transport.transfer(&mut buf);
        self.transport.digital_write(Pin::ChipSelect, Level::High)?;
        result
    }

    fn write_register(&mut self, addr: u8, value: u8) -> EcgResult<()> {
        let mut buf = [cmd::WREG | addr, 0x00, value];
        self.transport.digital_write(Pin::ChipSelect, Level::Low)?;
        let result = self.transport.transfer(&mut buf);
        self.transport.digital_write(Pin::ChipSelect, Level::High)?;
        result
    }

    fn read_register(&mut self, addr: u8) -> EcgResult<u8> {
        let mut buf = [cmd::RREG | addr, 0x00, 0x00];
        self.transport.digital_write(Pin::ChipSelect, Level::Low)?;
        let result = self.transport.transfer(&mut buf);
        self.transport.digital_write(Pin::ChipSelect, Level::High)?;
        result?;
        Ok(buf[2])
    }
}

/// Gains the control surface accepts; re-exported for the presentation layer.
pub fn allowed_gains() -> &'static [u8] {
    &ALLOWED_GAINS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HardwareSettings, LimitSettings};
    use crate::transport::mock::MockTransport;

    fn controller() -> SensorController<MockTransport> {
        let hw = HardwareSettings::default();
        let limits = LimitSettings { retry_delay: Duration::from_millis(0), ..Default::default() };
        SensorController::new(MockTransport::new(&hw), &hw, &limits)
    }

    #[tokio::test(start_paused = true)]
    async fn identify_accepts_expected_chip() {
        let mut c = controller();
        c.reset().await.unwrap();
        assert_eq!(c.identify().unwrap(), 0x73);
    }

    #[tokio::test(start_paused = true)]
    async fn identify_rejects_wrong_chip() {
        let hw = HardwareSettings::default();
        let limits = LimitSettings::default();
        let transport = MockTransport::new(&hw).with_device_id(0x3E);
        let mut c = SensorController::new(transport, &hw, &limits);
        c.reset().await.unwrap();
        match c.identify() {
            Err(EcgError::UnexpectedIdentity { expected: 0x73, got: 0x3E }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_verify_lands_value_and_tracks_known_good() {
        let mut c = controller();
        c.write_verify(regs::CONFIG1, 0x02, 5).await.unwrap();
        assert_eq!(c.known_good().get(&regs::CONFIG1), Some(&0x02));
        assert_eq!(c.transport_mut().register(regs::CONFIG1), 0x02);
    }

    #[tokio::test(start_paused = true)]
    async fn write_verify_exhausts_exactly_max_attempts() {
        let mut c = controller();
        let max_attempts = 5;
        c.transport_mut().inject_misreads(regs::CH1SET, max_attempts);

        let err = c.write_verify(regs::CH1SET, 0x40, max_attempts).await.unwrap_err();
        match err {
            EcgError::RegisterVerifyFailed { addr, expected, .. } => {
                assert_eq!(addr, regs::CH1SET);
                assert_eq!(expected, 0x40);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Exactly max_attempts write+read pairs hit the bus.
        assert_eq!(c.transport_mut().writes_to(regs::CH1SET), max_attempts);
        assert_eq!(c.transport_mut().reads_of(regs::CH1SET), max_attempts);
        assert!(c.known_good().get(&regs::CH1SET).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn write_verify_recovers_within_attempt_budget() {
        let mut c = controller();
        c.transport_mut().inject_misreads(regs::CONFIG2, 2);
        c.write_verify(regs::CONFIG2, 0xE0, 5).await.unwrap();
        assert_eq!(c.transport_mut().writes_to(regs::CONFIG2), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn configure_stops_at_first_failing_register() {
        let mut c = controller();
        c.transport_mut().inject_misreads(regs::CH1SET, 100);

        let table =
            [(regs::CONFIG1, 0x02), (regs::CH1SET, 0x00), (regs::CH2SET, 0x00)];
        let err = c.configure(&table).await.unwrap_err();
        match err {
            EcgError::RegisterVerifyFailed { addr, .. } => assert_eq!(addr, regs::CH1SET),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!c.is_configured());
        // The register after the failure was never touched.
        assert_eq!(c.transport_mut().writes_to(regs::CH2SET), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_stop_continuous_is_idempotent() {
        let mut c = controller();
        c.start_continuous().unwrap();
        c.start_continuous().unwrap();
        assert!(c.transport_mut().is_streaming());
        c.stop_continuous().unwrap();
        c.stop_continuous().unwrap();
        assert!(!c.transport_mut().is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn set_gain_rewrites_ch1set_and_resumes_streaming() {
        let mut c = controller();
        c.configure(&HardwareSettings::default().registers).await.unwrap();
        c.start_continuous().unwrap();
        c.set_gain(12).await.unwrap();
        assert_eq!(c.transport_mut().register(regs::CH1SET), 0b110 << 4);
        assert!(c.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_gain_write_invalidates_configuration() {
        let mut c = controller();
        c.configure(&HardwareSettings::default().registers).await.unwrap();
        c.start_continuous().unwrap();
        c.transport_mut().inject_misreads(regs::CH1SET, 100);

        let err = c.set_gain(12).await.unwrap_err();
        assert!(matches!(err, EcgError::RegisterVerifyFailed { addr, .. } if addr == regs::CH1SET));
        // CH1SET is no longer trustworthy: not known-good, not configured,
        // and streaming was not resumed.
        assert!(c.known_good().get(&regs::CH1SET).is_none());
        assert!(!c.is_configured());
        assert!(!c.is_streaming());
    }

    #[test]
    fn gain_bits_cover_allowed_set_only() {
        for gain in ALLOWED_GAINS {
            assert!(gain_bits(gain).is_ok());
        }
        assert!(matches!(gain_bits(7), Err(EcgError::InvalidGain { requested: 7 })));
        assert_eq!(gain_bits(6).unwrap(), 0x00);
        assert_eq!(gain_bits(1).unwrap(), 0x10);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_known_good() {
        let mut c = controller();
        c.write_verify(regs::CONFIG1, 0x02, 5).await.unwrap();
        c.reset().await.unwrap();
        assert!(c.known_good().is_empty());
        assert!(!c.is_configured());
    }
}
