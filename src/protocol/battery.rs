//! Battery voltage to charge percentage mapping.
//!
//! The probes run from a small cell whose discharge curve is not linear, so
//! the device firmware and the app agree on a fixed step table rather than
//! a formula.

/// Voltage thresholds, highest first. A reading at or above a threshold maps
/// to the paired percentage; anything below the last entry is empty.
const BATTERY_STEPS: [(f32, u8); 10] = [
    (2.28, 100),
    (2.21, 90),
    (2.15, 80),
    (2.08, 70),
    (2.02, 60),
    (1.95, 50),
    (1.89, 40),
    (1.82, 30),
    (1.76, 20),
    (1.69, 10),
];

/// Convert a probe battery voltage to a charge percentage.
///
/// # Example
///
/// ```
/// use tds_probe_ble::protocol::battery_percent;
///
/// assert_eq!(battery_percent(2.30), 100);
/// assert_eq!(battery_percent(2.10), 70);
/// assert_eq!(battery_percent(1.50), 0);
/// ```
pub fn battery_percent(volts: f32) -> u8 {
    BATTERY_STEPS
        .iter()
        .find(|(threshold, _)| volts >= *threshold)
        .map(|(_, percent)| *percent)
        .unwrap_or(0)
}
