//! Accessory device reference
//!
//! Wraps a `rusb::Device` with its cached IDs so the engine can hold it as an
//! opaque, cloneable candidate.

use crate::usb::aoa::is_accessory_mode;
use rusb::{Context, Device};
use std::fmt;

/// A USB device found in accessory mode
#[derive(Clone)]
pub struct UsbAccessory {
    device: Device<Context>,
    vendor_id: u16,
    product_id: u16,
}

impl UsbAccessory {
    /// Wrap `device` if it is in accessory mode
    pub fn from_device(device: Device<Context>) -> Option<Self> {
        let descriptor = device.device_descriptor().ok()?;
        let (vendor_id, product_id) = (descriptor.vendor_id(), descriptor.product_id());

        is_accessory_mode(vendor_id, product_id).then_some(Self {
            device,
            vendor_id,
            product_id,
        })
    }

    pub fn device(&self) -> &Device<Context> {
        &self.device
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Bus location, unique while the device stays attached
    pub fn location(&self) -> (u8, u8) {
        (self.device.bus_number(), self.device.address())
    }
}

impl fmt::Debug for UsbAccessory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (bus, address) = self.location();
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} device {:03})",
            self.vendor_id,
            self.product_id(),
            bus,
            address
        )
    }
}
