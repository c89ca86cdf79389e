//! BLE Service and Characteristic UUIDs.
//!
//! The probe hub uses an HM-10 style serial bridge: one vendor service with
//! one read/write/notify characteristic carrying traffic both ways.

use uuid::Uuid;

/// HM-10 serial bridge service UUID.
pub const TDS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// HM-10 serial characteristic UUID (Read, Write, Notify).
pub const TDS_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID is the probe hub's serial service.
pub fn is_tds_service(uuid: &Uuid) -> bool {
    *uuid == TDS_SERVICE_UUID
}
