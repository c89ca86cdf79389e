//! Device profiles.
//!
//! A profile knows which service a device family exposes and which
//! characteristics inside it carry commands and notifications. After service
//! discovery the state machine asks each configured profile in turn and uses
//! the first one that matches.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::ble::gatt::{CharacteristicRef, GattService};
use crate::ble::uuids::{TDS_CHARACTERISTIC_UUID, TDS_SERVICE_UUID};

/// Characteristics a profile resolved from a discovered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
    /// Characteristic notifications arrive on.
    pub notify: CharacteristicRef,
    /// Characteristic commands are written to.
    pub write: CharacteristicRef,
}

/// Capability interface for one device family.
pub trait DeviceProfile: Send + Sync {
    /// Human-readable name, for logs.
    fn name(&self) -> &'static str;

    /// The service that identifies this device family.
    fn service_uuid(&self) -> Uuid;

    /// Pick the notify and write characteristics out of `service`.
    fn resolve(&self, service: &GattService) -> Option<ResolvedCharacteristics>;
}

/// HM-10 (CC254x) serial bridge: one characteristic for both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hm10UartProfile;

impl DeviceProfile for Hm10UartProfile {
    fn name(&self) -> &'static str {
        "CC254x UART (HM-10)"
    }

    fn service_uuid(&self) -> Uuid {
        TDS_SERVICE_UUID
    }

    fn resolve(&self, service: &GattService) -> Option<ResolvedCharacteristics> {
        let characteristic = service.characteristic(&TDS_CHARACTERISTIC_UUID)?;

        if !characteristic.can_notify() || !characteristic.can_write() {
            // Some HM-10 clones under-report their properties; the
            // characteristic still works.
            warn!(
                "Characteristic {} reports properties {:?}",
                characteristic.uuid, characteristic.properties
            );
        }

        let handle = CharacteristicRef::new(service.uuid, characteristic.uuid);
        Some(ResolvedCharacteristics {
            notify: handle,
            write: handle,
        })
    }
}

/// The profiles a manager uses when none are given.
pub fn default_profiles() -> Vec<Box<dyn DeviceProfile>> {
    vec![Box::new(Hm10UartProfile)]
}

/// Find the first profile that matches the discovered services.
pub fn select_profile<'a>(
    profiles: &'a [Box<dyn DeviceProfile>],
    services: &[GattService],
) -> Option<(&'a dyn DeviceProfile, ResolvedCharacteristics)> {
    for profile in profiles {
        let Some(service) = services.iter().find(|s| s.uuid == profile.service_uuid()) else {
            continue;
        };

        match profile.resolve(service) {
            Some(resolved) => {
                debug!("Service {} matched profile {}", service.uuid, profile.name());
                return Some((profile.as_ref(), resolved));
            }
            None => {
                debug!(
                    "Service {} present but profile {} could not resolve its characteristics",
                    service.uuid,
                    profile.name()
                );
            }
        }
    }

    None
}
