//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `EcgError`, for the entire crate.
//! Using the `thiserror` crate, it provides a single result-or-error contract for
//! every operation; transient and fatal failures are distinguished by error kind
//! via [`EcgError::is_transient`], never by call-site convention.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: the bus layer failed outright. Fatal to the current
//!   bring-up attempt; during streaming it degrades the engine immediately.
//! - **`UnexpectedIdentity`**: the identity register did not match the expected
//!   chip. Fatal; configuration is never attempted against an unknown device.
//! - **`RegisterVerifyFailed`**: a register write could not be read back after
//!   the bounded retries. Fatal, names the offending register.
//! - **`DataReadyTimeout`** / **`DeviceFault`** / **`ValueOutOfRange`**: in-loop
//!   frame errors. Transient; counted and tolerated up to the configured
//!   consecutive-error threshold.
//! - **`Degraded`**: the threshold was crossed. Surfaced exactly once when the
//!   engine halts; recovery requires a fresh bring-up.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type EcgResult<T> = std::result::Result<T, EcgError>;

#[derive(Error, Debug)]
pub enum EcgError {
    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("unexpected device identity: expected 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedIdentity { expected: u8, got: u8 },

    #[error("register 0x{addr:02X} verify failed: wrote 0x{expected:02X}, read back 0x{got:02X}")]
    RegisterVerifyFailed { addr: u8, expected: u8, got: u8 },

    #[error("data-ready signal did not assert within the timeout")]
    DataReadyTimeout,

    #[error("device fault reported in frame status (0x{code:02X})")]
    DeviceFault { code: u8 },

    #[error("sample outside plausible range: {millivolts:.3} mV")]
    ValueOutOfRange { millivolts: f64 },

    #[error("acquisition degraded after {consecutive} consecutive errors")]
    Degraded { consecutive: u32 },

    #[error("gain {requested} is not in the supported set")]
    InvalidGain { requested: u8 },

    #[error("acquisition is not running")]
    NotRunning,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

impl EcgError {
    /// Whether the error is tolerated in the hot loop (counted against the
    /// consecutive-error threshold) rather than aborting outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EcgError::DataReadyTimeout
                | EcgError::DeviceFault { .. }
                | EcgError::ValueOutOfRange { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_are_transient() {
        assert!(EcgError::DataReadyTimeout.is_transient());
        assert!(EcgError::DeviceFault { code: 0xFF }.is_transient());
        assert!(EcgError::ValueOutOfRange { millivolts: 900.0 }.is_transient());
    }

    #[test]
    fn bring_up_errors_are_fatal() {
        assert!(!EcgError::Transport("spi".into()).is_transient());
        assert!(!EcgError::UnexpectedIdentity { expected: 0x73, got: 0x00 }.is_transient());
        assert!(!EcgError::RegisterVerifyFailed { addr: 0x01, expected: 0x02, got: 0x00 }
            .is_transient());
    }

    #[test]
    fn verify_failure_names_the_register() {
        let err = EcgError::RegisterVerifyFailed { addr: 0x04, expected: 0x40, got: 0x00 };
        assert!(err.to_string().contains("0x04"));
    }
}
