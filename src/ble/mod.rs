//! BLE communication module.
//!
//! The link state machine and everything it needs to reach a probe hub:
//! the platform GATT boundary, device profiles, the btleplug client and the
//! scanner.

pub mod btleplug_client;
pub mod connection;
pub mod gatt;
pub mod profile;
pub mod scanner;
pub mod uuids;

pub use btleplug_client::BtleplugClient;
pub use connection::{LinkState, LinkStatus};
pub use gatt::{
    CharacteristicRef, EventSink, GattCharacteristic, GattClient, GattService, PlatformEvent,
};
pub use profile::{default_profiles, DeviceProfile, Hm10UartProfile, ResolvedCharacteristics};
pub use scanner::{BleScanner, DiscoveredDevice};
pub use uuids::*;
