//! USB accessory manager
//!
//! Enumerates devices, switches matching ones into accessory mode and backs
//! the connection engine's [`AccessoryManager`] contract. Access is granted
//! per bus location once the device has been opened successfully; requests
//! are probed on a helper thread so callers never block.

use crate::config::AccessoryIdentity;
use crate::usb::aoa::{self, map_rusb_error};
use crate::usb::device::UsbAccessory;
use crate::usb::stream::UsbAccessoryStream;
use common::{Error, Result};
use engine::{AccessoryManager, PermissionResponder};
use parking_lot::Mutex;
use rusb::{Context, Device, UsbContext};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Summary of a device for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub accessory_mode: bool,
    pub switchable: bool,
}

pub struct UsbAccessoryManager {
    context: Context,
    /// Devices to switch into accessory mode (VID:PID patterns)
    filters: Vec<String>,
    identity: AccessoryIdentity,
    /// Bus locations the host may open
    granted: Arc<Mutex<HashSet<(u8, u8)>>>,
}

impl UsbAccessoryManager {
    pub fn new(filters: Vec<String>, identity: AccessoryIdentity) -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;

        Ok(Self {
            context,
            filters,
            identity,
            granted: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Devices currently in accessory mode, in enumeration order
    pub fn accessories(&self) -> Vec<UsbAccessory> {
        match self.context.devices() {
            Ok(devices) => devices.iter().filter_map(UsbAccessory::from_device).collect(),
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Every attached device with its accessory status
    pub fn summaries(&self) -> Result<Vec<DeviceSummary>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;

        Ok(devices
            .iter()
            .filter_map(|device| {
                let desc = device.device_descriptor().ok()?;
                let (vid, pid) = (desc.vendor_id(), desc.product_id());
                Some(DeviceSummary {
                    bus: device.bus_number(),
                    address: device.address(),
                    vendor_id: vid,
                    product_id: pid,
                    accessory_mode: aoa::is_accessory_mode(vid, pid),
                    switchable: self.is_switch_candidate(vid, pid),
                })
            })
            .collect())
    }

    /// Whether a non-accessory device should be switched into accessory mode
    pub fn is_switch_candidate(&self, vendor_id: u16, product_id: u16) -> bool {
        !aoa::is_accessory_mode(vendor_id, product_id)
            && Self::check_filter(vendor_id, product_id, &self.filters)
    }

    /// Switch every matching device into accessory mode
    ///
    /// Returns how many devices accepted the handshake.
    pub fn switch_matching_devices(&self) -> usize {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return 0;
            }
        };

        devices
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|d| self.is_switch_candidate(d.vendor_id(), d.product_id()))
                    .unwrap_or(false)
            })
            .filter(|device| match self.switch_device(device) {
                Ok(_) => true,
                Err(e) => {
                    warn!(
                        "Accessory handshake failed on bus {:03} device {:03}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    false
                }
            })
            .count()
    }

    /// Switch the device at a bus location, as reported by hot-plug
    pub fn switch_at(&self, bus: u8, address: u8) -> Result<u16> {
        let device = self
            .find_device(|d| d.bus_number() == bus && d.address() == address)?
            .ok_or_else(|| Error::Usb(format!("No device at bus {:03} address {:03}", bus, address)))?;
        self.switch_device(&device)
    }

    /// Switch the first device with `vendor_id`, ignoring filters
    ///
    /// A device already in accessory mode needs no handshake and yields
    /// `Ok(None)`.
    pub fn switch_vendor(&self, vendor_id: u16) -> Result<Option<u16>> {
        if self.accessories().iter().any(|a| a.vendor_id() == vendor_id) {
            info!("Device is already in accessory mode");
            return Ok(None);
        }

        let device = self
            .find_device(|d| {
                d.device_descriptor()
                    .map(|desc| desc.vendor_id() == vendor_id)
                    .unwrap_or(false)
            })?
            .ok_or_else(|| Error::Usb(format!("No compatible device with VID {:04x}", vendor_id)))?;

        self.switch_device(&device).map(Some)
    }

    /// Forget the grant for a location whose device has left
    pub fn forget(&self, bus: u8, address: u8) {
        if self.granted.lock().remove(&(bus, address)) {
            debug!("Forgot access grant for bus {:03} device {:03}", bus, address);
        }
    }

    fn switch_device(&self, device: &Device<Context>) -> Result<u16> {
        info!(
            "Switching bus {:03} device {:03} into accessory mode",
            device.bus_number(),
            device.address()
        );
        let handle = device.open().map_err(map_rusb_error)?;
        aoa::start_accessory_mode(&handle, &self.identity)
    }

    fn find_device<F>(&self, predicate: F) -> Result<Option<Device<Context>>>
    where
        F: Fn(&Device<Context>) -> bool,
    {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        Ok(devices.iter().find(|d| predicate(d)))
    }

    /// Check if a VID/PID pair is allowed by the filters
    ///
    /// An empty filter list matches nothing.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            Self::match_id(filter_vid, vid) && Self::match_id(filter_pid, pid)
        })
    }

    fn match_id(pattern: &str, id: u16) -> bool {
        if pattern == "*" {
            return true;
        }
        let hex = pattern
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        u16::from_str_radix(hex, 16)
            .map(|v| v == id)
            .unwrap_or(false)
    }
}

impl AccessoryManager for UsbAccessoryManager {
    type Device = UsbAccessory;
    type Stream = UsbAccessoryStream;

    fn has_permission(&self, device: &UsbAccessory) -> bool {
        self.granted.lock().contains(&device.location())
    }

    fn request_permission(&self, device: &UsbAccessory, responder: PermissionResponder) {
        let granted = Arc::clone(&self.granted);
        let device = device.clone();

        let spawned = thread::Builder::new()
            .name("permission-probe".to_string())
            .spawn(move || match device.device().open() {
                Ok(_handle) => {
                    granted.lock().insert(device.location());
                    responder.grant();
                }
                Err(rusb::Error::Access) => {
                    warn!(
                        "No access to {:?}; add a udev rule granting access to VID {:04x}",
                        device,
                        device.vendor_id()
                    );
                    responder.deny();
                }
                Err(e) => {
                    warn!("Could not probe {:?}: {}", device, e);
                    responder.deny();
                }
            });

        if let Err(e) = spawned {
            warn!("Failed to spawn permission probe: {}", e);
        }
    }

    fn open(&self, device: &UsbAccessory) -> Result<UsbAccessoryStream> {
        UsbAccessoryStream::open(device.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            "0x1234:0x5678".to_string(), // Exact match
            "0xABCD:*".to_string(),      // Wildcard PID
        ];

        assert!(UsbAccessoryManager::check_filter(0x1234, 0x5678, &filters));
        assert!(UsbAccessoryManager::check_filter(0xABCD, 0x1111, &filters));
        assert!(UsbAccessoryManager::check_filter(0xABCD, 0x9999, &filters));

        assert!(!UsbAccessoryManager::check_filter(0x1234, 0x9999, &filters));
        assert!(!UsbAccessoryManager::check_filter(0x9999, 0x5678, &filters));

        // Empty filters switch nothing
        assert!(!UsbAccessoryManager::check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_filter_ignores_malformed_entries() {
        let filters = vec!["0x1234".to_string(), "zz:*".to_string()];
        assert!(!UsbAccessoryManager::check_filter(0x1234, 0x0001, &filters));
    }

    #[test]
    fn test_switch_candidate_excludes_accessory_mode() {
        // Context creation fails without a usable libusb backend
        let Ok(manager) =
            UsbAccessoryManager::new(vec!["*:*".to_string()], AccessoryIdentity::default())
        else {
            return;
        };

        assert!(manager.is_switch_candidate(0x04E8, 0x6860));
        assert!(!manager.is_switch_candidate(0x18D1, 0x2D01));
    }
}
