// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # tds-probe-ble
//!
//! A cross-platform Rust library for talking to a dual-probe TDS (total
//! dissolved solids) meter over Bluetooth Low Energy.
//!
//! The meter sits behind an HM-10 style serial bridge: one characteristic
//! carries single-byte commands to the device and ASCII frames back. This
//! crate owns that link end to end.
//!
//! ## Features
//!
//! - **Connection lifecycle**: connect, discover, enable notifications, and
//!   report every state change
//! - **Reliable commands**: START/STOP are retransmitted until acknowledged
//! - **Telemetry**: paired probe readings and battery levels as events
//! - **Transit velocity**: peak-to-peak tracer timing between the probes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tds_probe_ble::{BleConnectionManager, BleScanner, BtleplugClient, DeviceEvent, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scanner = BleScanner::new().await?;
//!     let device = scanner.find_device(Duration::from_secs(10)).await?;
//!
//!     let manager = BleConnectionManager::new(BtleplugClient::new());
//!     let mut events = manager.subscribe();
//!
//!     manager.connect(device).await?;
//!     manager.send_start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let DeviceEvent::TelemetryReceived { reading, .. } = event {
//!             println!("{:.2} ppm / {:.2} ppm", reading.probe1, reading.probe2);
//!         }
//!     }
//!
//!     manager.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod connection_manager;
pub mod data;
pub mod error;
pub mod events;
pub mod protocol;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use connection_manager::{BleConnectionManager, ConnectionManager};
pub use error::{Error, Result};
pub use events::{CallbackHandle, DeviceEvent, EventPublisher, RunState, Subscription};
pub use utils::{feet_to_meters, round_to_decimals};

// Re-export commonly used types from submodules
pub use ble::{
    BleScanner, BtleplugClient, DeviceProfile, EventSink, GattClient, GattService, LinkState,
    PlatformEvent,
};
pub use data::{BatteryLevels, BatteryReport, DistanceUnit, Telemetry, TransitRecorder};
pub use protocol::{battery_percent, Command, CommandOutcome, Frame, RetryPolicy};
