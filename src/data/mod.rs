//! Data structures for probe data.
//!
//! Decoded readings and battery levels, and the transit recorder that turns
//! a run of readings into a flow velocity.

pub mod readings;
pub mod transit;

pub use readings::{BatteryLevels, BatteryReport, Telemetry};
pub use transit::{DistanceUnit, Sample, TransitRecorder};
