//! BLE scanning functionality.
//!
//! Finds probe hubs advertising the serial bridge service.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::ble::uuids::{is_tds_service, TDS_SERVICE_UUID};
use crate::error::{Error, Result};

/// A probe hub seen while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The BLE peripheral identifier.
    pub identifier: String,
    /// The peripheral handle, ready to connect.
    pub peripheral: Peripheral,
    /// Advertised name, if any.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// BLE scanner for probe hubs.
pub struct BleScanner {
    adapter: Adapter,
    is_scanning: Arc<RwLock<bool>>,
    discovered: Arc<RwLock<HashMap<String, DiscoveredDevice>>>,
    event_tx: broadcast::Sender<DiscoveredDevice>,
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl BleScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a scanner on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(32);

        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start scanning for probe hubs.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for TDS probe hubs");

        let filter = ScanFilter {
            services: vec![TDS_SERVICE_UUID],
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        if let Some(id) = Self::peripheral_id(event) {
                            Self::process_peripheral(&adapter, id, &discovered, &event_tx).await;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Every probe hub seen so far.
    pub fn discovered_devices(&self) -> HashMap<String, DiscoveredDevice> {
        self.discovered.read().clone()
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan until a probe hub shows up, preferring the strongest signal
    /// among those already seen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if nothing is found within `timeout`.
    pub async fn find_device(&self, timeout: Duration) -> Result<Peripheral> {
        let mut rx = self.subscribe();
        self.start_scanning().await?;

        let nearest = self
            .discovered
            .read()
            .values()
            .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
            .cloned();

        let found = match nearest {
            Some(device) => Some(device),
            None => tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(device) => return Some(device),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .await
            .ok()
            .flatten(),
        };

        self.stop_scanning().await?;

        let device = found.ok_or(Error::DeviceNotFound)?;
        info!(
            "Found {} ({}), RSSI {:?}",
            device.local_name.as_deref().unwrap_or("unnamed device"),
            device.identifier,
            device.rssi
        );
        Ok(device.peripheral)
    }

    fn peripheral_id(event: CentralEvent) -> Option<PeripheralId> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
            CentralEvent::ServicesAdvertisement { id, services } => {
                services.iter().any(is_tds_service).then_some(id)
            }
            _ => None,
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        discovered: &Arc<RwLock<HashMap<String, DiscoveredDevice>>>,
        event_tx: &broadcast::Sender<DiscoveredDevice>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // Some platforms ignore the scan filter.
        if !properties.services.iter().any(is_tds_service) {
            return;
        }

        let identifier = id.to_string();
        let device = DiscoveredDevice {
            identifier: identifier.clone(),
            peripheral,
            local_name: properties.local_name,
            rssi: properties.rssi,
        };

        let is_new = discovered.write().insert(identifier, device.clone()).is_none();
        if is_new {
            debug!("Probe hub discovered: {}", device.identifier);
        }

        let _ = event_tx.send(device);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
