//! Utility functions for the tds-probe-ble crate.

/// Meters per foot.
pub const METERS_PER_FOOT: f64 = 0.3048;

/// Convert feet to meters.
///
/// # Example
///
/// ```
/// use tds_probe_ble::feet_to_meters;
///
/// let meters = feet_to_meters(10.0);
/// assert!((meters - 3.048).abs() < 0.0001);
/// ```
#[inline]
pub fn feet_to_meters(feet: f64) -> f64 {
    feet * METERS_PER_FOOT
}

/// Round to a fixed number of decimal places.
///
/// # Example
///
/// ```
/// use tds_probe_ble::round_to_decimals;
///
/// assert_eq!(round_to_decimals(1.23456, 2), 1.23);
/// assert_eq!(round_to_decimals(2.25, 1), 2.3);
/// ```
#[inline]
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
