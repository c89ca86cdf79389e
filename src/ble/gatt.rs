//! Platform GATT boundary.
//!
//! The connection state machine never talks to a Bluetooth stack directly.
//! It issues non-blocking requests through [`GattClient`] and learns about
//! their outcome from [`PlatformEvent`]s the client posts through an
//! [`EventSink`]. Every sink is bound to one session, so late callbacks from
//! a link that has already been replaced are recognised and dropped.

use btleplug::api::CharPropFlags;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::error::Result;

/// A characteristic discovered on the remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharPropFlags,
}

impl GattCharacteristic {
    /// Create a new characteristic description.
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        Self { uuid, properties }
    }

    /// Check if the characteristic can push notifications.
    pub fn can_notify(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }

    /// Check if the characteristic accepts writes of either kind.
    pub fn can_write(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }
}

/// A service discovered on the remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in this service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Create a new service description.
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Handle to a resolved characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// UUID of the owning service.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    /// Create a new characteristic handle.
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Asynchronous outcome reported by the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// The physical link is up.
    Connected,
    /// The physical link could not be established.
    ConnectFailed {
        /// Platform description of the failure.
        reason: String,
    },
    /// Service discovery finished.
    ServicesDiscovered(Vec<GattService>),
    /// Notifications are enabled on the requested characteristic.
    NotificationsEnabled,
    /// A notification payload arrived.
    Notification(Bytes),
    /// A write could not be delivered.
    WriteFailed {
        /// Platform description of the failure.
        reason: String,
    },
    /// The remote device went away.
    LinkLost,
    /// The GATT layer reported an error.
    GattError {
        /// Platform description of the failure.
        reason: String,
    },
}

/// A platform event tagged with the session that produced it.
#[derive(Debug, Clone)]
pub(crate) struct SessionEvent {
    pub(crate) session: u64,
    pub(crate) event: PlatformEvent,
}

/// Where a [`GattClient`] posts the outcome of its requests.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub(crate) fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    /// The session this sink belongs to.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Post an event. Returns `false` once the manager has shut down.
    pub fn post(&self, event: PlatformEvent) -> bool {
        trace!("Platform event for session {}: {:?}", self.session, event);
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }

    /// Post a notification payload.
    pub fn notify(&self, payload: impl Into<Bytes>) -> bool {
        self.post(PlatformEvent::Notification(payload.into()))
    }
}

/// Non-blocking access to a platform GATT client.
///
/// Every method only issues a request and returns. An `Err` means the
/// request could not be issued at all; everything that happens afterwards,
/// success or failure, is reported through the [`EventSink`] handed to
/// [`connect`](GattClient::connect).
pub trait GattClient: Send + 'static {
    /// The handle a scanner produces for a connectable device.
    type Device: Send + 'static;

    /// Start connecting to `device`. Outcomes go to `events`.
    fn connect(&mut self, device: Self::Device, events: EventSink) -> Result<()>;

    /// Start service discovery on the connected device.
    fn discover_services(&mut self) -> Result<()>;

    /// Enable notifications on a characteristic.
    fn enable_notifications(&mut self, characteristic: CharacteristicRef) -> Result<()>;

    /// Write a payload to a characteristic.
    fn write(&mut self, characteristic: CharacteristicRef, payload: &[u8]) -> Result<()>;

    /// Tear the link down and release platform resources. Must not post
    /// any further events for the current session.
    fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;

    #[test]
    fn test_characteristic_capabilities() {
        let c = GattCharacteristic::new(
            TDS_CHARACTERISTIC_UUID,
            CharPropFlags::READ | CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY,
        );
        assert!(c.can_notify());
        assert!(c.can_write());

        let read_only = GattCharacteristic::new(TDS_CHARACTERISTIC_UUID, CharPropFlags::READ);
        assert!(!read_only.can_notify());
        assert!(!read_only.can_write());
    }

    #[test]
    fn test_service_lookup() {
        let service = GattService::new(
            TDS_SERVICE_UUID,
            vec![GattCharacteristic::new(
                TDS_CHARACTERISTIC_UUID,
                CharPropFlags::NOTIFY,
            )],
        );
        assert!(service.characteristic(&TDS_CHARACTERISTIC_UUID).is_some());
        assert!(service.characteristic(&TDS_SERVICE_UUID).is_none());
    }

    #[test]
    fn test_sink_tags_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert_eq!(sink.session(), 7);
        assert!(sink.notify(&b"A"[..]));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.session, 7);
        assert_eq!(
            event.event,
            PlatformEvent::Notification(Bytes::from_static(b"A"))
        );

        drop(rx);
        assert!(!sink.post(PlatformEvent::LinkLost));
    }
}
