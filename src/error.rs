//! Error types for the tds-probe-ble crate.

use thiserror::Error;

use crate::protocol::frame::Command;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No device advertising the probe service was found.
    #[error("No TDS device found")]
    DeviceNotFound,

    /// Operation requires a ready link but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the device was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Another command is still waiting for its acknowledgment.
    #[error("Command {pending} still awaiting acknowledgment")]
    CommandPending {
        /// The command that is in flight.
        pending: Command,
    },

    /// The device never acknowledged a command.
    #[error("Command {command} not acknowledged after {attempts} attempts")]
    CommandTimeout {
        /// The command that was sent.
        command: Command,
        /// Number of transmissions made.
        attempts: u32,
    },

    /// The command was cancelled because the link went down.
    #[error("Command {command} abandoned: link closed")]
    CommandAbandoned {
        /// The command that was cancelled.
        command: Command,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
