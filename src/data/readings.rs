//! Probe reading data structures.
//!
//! Contains the decoded TDS telemetry pair and the battery levels derived
//! from battery voltage reports.

/// One telemetry sample: a TDS reading from each probe, in ppm.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Telemetry {
    /// Reading from the first probe (ppm).
    pub probe1: f32,
    /// Reading from the second probe (ppm).
    pub probe2: f32,
}

impl Telemetry {
    /// Create a new telemetry sample.
    pub fn new(probe1: f32, probe2: f32) -> Self {
        Self { probe1, probe2 }
    }
}

/// Raw battery voltages reported by the device for both probes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryReport {
    /// Battery voltage of the first probe.
    pub probe1_volts: f32,
    /// Battery voltage of the second probe.
    pub probe2_volts: f32,
}

impl BatteryReport {
    /// Create a new battery report.
    pub fn new(probe1_volts: f32, probe2_volts: f32) -> Self {
        Self {
            probe1_volts,
            probe2_volts,
        }
    }

    /// Convert both voltages to charge percentages.
    pub fn levels(&self) -> BatteryLevels {
        BatteryLevels {
            probe1: crate::protocol::battery::battery_percent(self.probe1_volts),
            probe2: crate::protocol::battery::battery_percent(self.probe2_volts),
        }
    }
}

/// Battery charge of both probes, as whole percentages (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryLevels {
    /// Charge of the first probe.
    pub probe1: u8,
    /// Charge of the second probe.
    pub probe2: u8,
}

impl BatteryLevels {
    /// The lower of the two charge levels.
    pub fn lowest(&self) -> u8 {
        self.probe1.min(self.probe2)
    }
}
