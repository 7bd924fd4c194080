//! Signal conditioning and rate estimation.
//!
//! Both components are streaming and stateful: one call per accepted sample,
//! in arrival order, owned exclusively by the acquisition task.

pub mod filter;
pub mod heart_rate;

pub use filter::ConditioningPipeline;
pub use heart_rate::HeartRateEstimator;
