//! btleplug implementation of the GATT boundary.
//!
//! Every request is issued on its own task and reports back through the
//! session's [`EventSink`]. The notification listener doubles as the link
//! watchdog: it reports [`PlatformEvent::LinkLost`] when the notification
//! stream ends or the peripheral stops reporting itself as connected.

use btleplug::api::{Characteristic, CharPropFlags, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::ble::gatt::{
    CharacteristicRef, EventSink, GattCharacteristic, GattClient, GattService, PlatformEvent,
};
use crate::error::{Error, Result};

/// How often the listener checks that the peripheral is still connected.
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// The live link: the peripheral and where its events go.
#[derive(Clone)]
struct Link {
    peripheral: Peripheral,
    events: EventSink,
}

/// [`GattClient`] backed by a btleplug peripheral.
pub struct BtleplugClient {
    link: Option<Link>,
    /// Characteristics found by the last service discovery.
    characteristics: Arc<RwLock<Vec<Characteristic>>>,
    /// Outstanding request tasks.
    tasks: Vec<JoinHandle<()>>,
    /// Notification listener task.
    listener: Option<JoinHandle<()>>,
}

impl BtleplugClient {
    /// Create a client with no link.
    pub fn new() -> Self {
        Self {
            link: None,
            characteristics: Arc::new(RwLock::new(Vec::new())),
            tasks: Vec::new(),
            listener: None,
        }
    }

    fn link(&self) -> Result<Link> {
        self.link.clone().ok_or(Error::NotConnected)
    }

    fn lookup(&self, target: CharacteristicRef) -> Result<Characteristic> {
        self.characteristics
            .read()
            .iter()
            .find(|c| c.service_uuid == target.service && c.uuid == target.characteristic)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: target.characteristic.to_string(),
            })
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Default for BtleplugClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GattClient for BtleplugClient {
    type Device = Peripheral;

    fn connect(&mut self, device: Peripheral, events: EventSink) -> Result<()> {
        self.disconnect();

        debug!("Connecting to peripheral {:?}", device.id());
        let link = Link {
            peripheral: device,
            events,
        };
        self.link = Some(link.clone());

        self.spawn(async move {
            match link.peripheral.connect().await {
                Ok(()) => {
                    link.events.post(PlatformEvent::Connected);
                }
                Err(e) => {
                    link.events.post(PlatformEvent::ConnectFailed {
                        reason: e.to_string(),
                    });
                }
            }
        });

        Ok(())
    }

    fn discover_services(&mut self) -> Result<()> {
        let link = self.link()?;
        let cache = self.characteristics.clone();

        self.spawn(async move {
            if let Err(e) = link.peripheral.discover_services().await {
                warn!("Failed to discover services: {}", e);
                link.events.post(PlatformEvent::GattError {
                    reason: e.to_string(),
                });
                return;
            }

            let mut discovered = Vec::new();
            let mut services = Vec::new();
            for service in link.peripheral.services() {
                let characteristics = service
                    .characteristics
                    .iter()
                    .map(|c| {
                        debug!("Found characteristic: {} in service {}", c.uuid, service.uuid);
                        GattCharacteristic::new(c.uuid, c.properties)
                    })
                    .collect();
                discovered.extend(service.characteristics.iter().cloned());
                services.push(GattService::new(service.uuid, characteristics));
            }

            *cache.write() = discovered;
            link.events.post(PlatformEvent::ServicesDiscovered(services));
        });

        Ok(())
    }

    fn enable_notifications(&mut self, target: CharacteristicRef) -> Result<()> {
        let link = self.link()?;
        let characteristic = self.lookup(target)?;

        if let Some(previous) = self.listener.take() {
            previous.abort();
        }

        self.listener = Some(tokio::spawn(async move {
            // Open the stream before subscribing so no early payload is missed.
            let mut notifications = match link.peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    link.events.post(PlatformEvent::GattError {
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            if let Err(e) = link.peripheral.subscribe(&characteristic).await {
                debug!("Failed to subscribe to {}: {:?}", characteristic.uuid, e);
                link.events.post(PlatformEvent::GattError {
                    reason: e.to_string(),
                });
                return;
            }

            debug!("Subscribed to notifications from {}", characteristic.uuid);
            if !link.events.post(PlatformEvent::NotificationsEnabled) {
                return;
            }

            let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == characteristic.uuid => {
                            trace!("Notification: {} bytes, data: {:02X?}", n.value.len(), n.value);
                            if !link.events.notify(n.value) {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => {
                            debug!("Notification stream ended");
                            link.events.post(PlatformEvent::LinkLost);
                            break;
                        }
                    },
                    _ = link_check.tick() => {
                        if !link.peripheral.is_connected().await.unwrap_or(false) {
                            link.events.post(PlatformEvent::LinkLost);
                            break;
                        }
                    }
                }
            }

            debug!("Notification listener stopped");
        }));

        Ok(())
    }

    fn write(&mut self, target: CharacteristicRef, payload: &[u8]) -> Result<()> {
        let link = self.link()?;
        let characteristic = self.lookup(target)?;

        let write_type = if characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        let data = payload.to_vec();

        self.spawn(async move {
            match link.peripheral.write(&characteristic, &data, write_type).await {
                Ok(()) => trace!("Wrote {} bytes to characteristic {}", data.len(), characteristic.uuid),
                Err(e) => {
                    link.events.post(PlatformEvent::WriteFailed {
                        reason: e.to_string(),
                    });
                }
            }
        });

        Ok(())
    }

    fn disconnect(&mut self) {
        self.abort_tasks();
        self.characteristics.write().clear();
        self.release_link();
    }
}

impl BtleplugClient {
    /// Drop the session sink and disconnect the peripheral in the background.
    ///
    /// Nothing may be posted for the session any more, so the sink goes
    /// first. Without a runtime the peripheral is left to the OS.
    fn release_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        let peripheral = link.peripheral;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("Disconnect error (ignored): {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to disconnect the peripheral on"),
        }
    }
}

impl Drop for BtleplugClient {
    fn drop(&mut self) {
        self.abort_tasks();
        self.release_link();
    }
}

impl std::fmt::Debug for BtleplugClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugClient")
            .field("linked", &self.link.is_some())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
