//! Acquisition and conditioning engine for a two-channel biopotential front
//! end (ADS1292R-class).
//!
//! The crate is layered from the bus upward:
//!
//! - [`transport`]: the bus abstraction ([`transport::BusTransport`]) plus a
//!   fully simulated front end for tests and demos.
//! - [`sensor`]: the register protocol (reset, identity check,
//!   write-with-verify, continuous-conversion control).
//! - [`acquisition`]: the fixed-cadence sample loop, its state machine and
//!   error policy, and the [`acquisition::EngineHandle`] control surface.
//! - [`processing`]: streaming passband + mains-notch conditioning and the
//!   peak-based heart-rate estimator.
//! - [`telemetry`]: bounded rings and health flags shared with consumers.
//!
//! A typical embedding constructs [`config::Settings`], wraps a transport in an
//! [`acquisition::AcquisitionEngine`], spawns it, and talks to the returned
//! handle.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod processing;
pub mod sensor;
pub mod telemetry;
pub mod transport;

pub use acquisition::{AcquisitionEngine, AcquisitionState, EngineHandle, Sample};
pub use config::Settings;
pub use error::{EcgError, EcgResult};
pub use telemetry::{Health, SignalQuality, TelemetrySnapshot};
