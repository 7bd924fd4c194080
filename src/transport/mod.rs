//! Bus transport capability.
//!
//! The engine never talks to a serial peripheral or GPIO controller directly;
//! it is written against [`BusTransport`], a synchronous, bounded-latency,
//! fallible capability: exchange N bytes full-duplex, read one digital input,
//! drive one digital output. The transport has no knowledge of the chip's
//! register protocol; that lives in [`crate::sensor`].
//!
//! [`mock::MockTransport`] implements the trait against a simulated front end
//! for tests and hardware-free demos.

pub mod mock;

use crate::error::EcgResult;

/// Logical pins the engine drives or observes. The transport maps these to
/// whatever the platform actually wires them to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// Asserted (low) by the chip when a new frame is available.
    DataReady,
    /// Conversion start line.
    Start,
    /// Hardware reset line, active low.
    Reset,
    /// SPI chip select, active low.
    ChipSelect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_low(self) -> bool {
        self == Level::Low
    }
}

/// Byte exchange plus single-bit digital I/O over named logical pins.
///
/// All methods are synchronous and expected to complete in bounded time; the
/// acquisition loop's only suspension points are the data-ready wait and the
/// inter-cycle sleep, never inside a transfer.
pub trait BusTransport: Send {
    /// Full-duplex exchange: `buf` is written out and overwritten in place
    /// with the bytes clocked back.
    fn transfer(&mut self, buf: &mut [u8]) -> EcgResult<()>;

    /// Read the current level of a digital input pin.
    fn digital_read(&mut self, pin: Pin) -> EcgResult<Level>;

    /// Drive a digital output pin.
    fn digital_write(&mut self, pin: Pin, level: Level) -> EcgResult<()>;
}
