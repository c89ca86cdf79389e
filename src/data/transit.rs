//! Transit velocity measurement.
//!
//! A tracer is injected upstream of both probes. Each probe sees a TDS peak
//! as the tracer passes; the time between the two peaks over the known
//! distance between the probes gives the flow velocity.

use chrono::{DateTime, Utc};

use crate::data::Telemetry;
use crate::utils::{feet_to_meters, round_to_decimals};

/// Unit the velocity is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DistanceUnit {
    /// Feet per second.
    #[default]
    Feet,
    /// Meters per second.
    Meters,
}

/// One probe reading placed on the run's time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sample {
    /// Seconds since the first sample of the run, to one decimal.
    pub elapsed_secs: f64,
    /// Reading in ppm.
    pub ppm: f32,
}

/// Records a run of telemetry and derives the tracer's transit velocity.
#[derive(Debug, Clone, Default)]
pub struct TransitRecorder {
    started_at: Option<DateTime<Utc>>,
    probe1: Vec<Sample>,
    probe2: Vec<Sample>,
}

impl TransitRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reading. The first reading of a run is at t = 0.
    pub fn record(&mut self, reading: &Telemetry, received_at: DateTime<Utc>) {
        let started_at = *self.started_at.get_or_insert(received_at);
        let millis = (received_at - started_at).num_milliseconds().max(0);
        let elapsed_secs = round_to_decimals(millis as f64 / 1000.0, 1);

        self.probe1.push(Sample {
            elapsed_secs,
            ppm: reading.probe1,
        });
        self.probe2.push(Sample {
            elapsed_secs,
            ppm: reading.probe2,
        });
    }

    /// Samples recorded from the first probe.
    pub fn probe1_samples(&self) -> &[Sample] {
        &self.probe1
    }

    /// Samples recorded from the second probe.
    pub fn probe2_samples(&self) -> &[Sample] {
        &self.probe2
    }

    /// Number of readings recorded.
    pub fn len(&self) -> usize {
        self.probe1.len()
    }

    /// Check if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.probe1.is_empty()
    }

    /// The first maximum seen by each probe.
    pub fn peaks(&self) -> Option<(Sample, Sample)> {
        Some((first_peak(&self.probe1)?, first_peak(&self.probe2)?))
    }

    /// Seconds between the two probes' peaks.
    pub fn transit_time(&self) -> Option<f64> {
        let (p1, p2) = self.peaks()?;
        Some((p2.elapsed_secs - p1.elapsed_secs).abs())
    }

    /// Velocity over `distance_feet` between the probes, rounded to two
    /// decimals. `None` when there is no usable transit time.
    pub fn velocity(&self, distance_feet: f64, unit: DistanceUnit) -> Option<f64> {
        let transit_time = self.transit_time()?;
        let distance = match unit {
            DistanceUnit::Feet => distance_feet,
            DistanceUnit::Meters => feet_to_meters(distance_feet),
        };

        let velocity = round_to_decimals(distance / transit_time, 2);
        velocity.is_finite().then_some(velocity)
    }

    /// Discard the run.
    pub fn reset(&mut self) {
        self.started_at = None;
        self.probe1.clear();
        self.probe2.clear();
    }
}

fn first_peak(samples: &[Sample]) -> Option<Sample> {
    samples.iter().copied().fold(None, |best, sample| match best {
        Some(b) if b.ppm >= sample.ppm => Some(b),
        _ => Some(sample),
    })
}
