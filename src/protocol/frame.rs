//! Command encoding and notification frame decoding.
//!
//! The device multiplexes everything over one characteristic:
//!
//! - Host to device: a single ASCII byte, `'S'` (start) or `'E'` (stop).
//! - Device to host:
//!   - `"A"` acknowledges the last command.
//!   - `"<p1>:<p2>"` is a TDS reading from each probe, in ppm.
//!   - `"<v1>V<v2>"` is the battery voltage of each probe.
//!
//! Decoding never fails: anything that is not one of the above is returned
//! as [`Frame::Malformed`] and left for the caller to log and drop.

use bytes::Bytes;

use crate::data::{BatteryReport, Telemetry};

/// Acknowledgment marker sent by the device.
pub const ACK_BYTE: u8 = b'A';
/// Separator between the two probe readings in a telemetry frame.
pub const TELEMETRY_DELIMITER: char = ':';
/// Separator between the two probe voltages in a battery frame.
pub const BATTERY_DELIMITER: char = 'V';

/// Commands understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    /// Begin streaming telemetry.
    Start,
    /// Stop streaming telemetry.
    Stop,
}

impl Command {
    /// The wire byte for this command.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Start => b'S',
            Self::Stop => b'E',
        }
    }

    /// Look up a command from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'S' => Some(Self::Start),
            b'E' => Some(Self::Stop),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}

/// A decoded notification payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The device acknowledged the last command.
    Acknowledgment,
    /// A TDS reading from each probe.
    Telemetry(Telemetry),
    /// Battery voltages of each probe.
    BatteryReport(BatteryReport),
    /// Anything else, kept verbatim for logging.
    Malformed(Bytes),
}

impl Frame {
    /// Check if this is an acknowledgment.
    pub fn is_acknowledgment(&self) -> bool {
        matches!(self, Self::Acknowledgment)
    }
}

/// Encode a command into its one-byte payload.
pub fn encode(command: Command) -> [u8; 1] {
    [command.to_byte()]
}

/// Decode a notification payload.
pub fn decode(payload: &[u8]) -> Frame {
    if payload == [ACK_BYTE] {
        return Frame::Acknowledgment;
    }

    // The HM-10 passes the firmware's bytes through untouched; treat them as
    // Latin-1 so a stray high byte cannot make the whole frame unreadable.
    let text: String = payload.iter().map(|&b| b as char).collect();

    if let Some((probe1, probe2)) = split_pair(&text, TELEMETRY_DELIMITER) {
        return Frame::Telemetry(Telemetry::new(probe1, probe2));
    }

    if let Some((volts1, volts2)) = split_pair(&text, BATTERY_DELIMITER) {
        return Frame::BatteryReport(BatteryReport::new(volts1, volts2));
    }

    Frame::Malformed(Bytes::copy_from_slice(payload))
}

/// Split `text` on `delimiter` into exactly two finite numbers.
fn split_pair(text: &str, delimiter: char) -> Option<(f32, f32)> {
    let mut fields = text.split(delimiter);
    let first = parse_field(fields.next()?)?;
    let second = parse_field(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }
    Some((first, second))
}

fn parse_field(field: &str) -> Option<f32> {
    field
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
}
