//! USB subsystem
//!
//! Host side of the Android Open Accessory protocol:
//! - Switching matching devices into accessory mode
//! - Discovering accessory-mode devices and probing access
//! - Bulk-endpoint duplex stream for the connection engine
//! - Hot-plug notifications from a dedicated libusb event thread

pub mod aoa;
pub mod device;
pub mod manager;
pub mod stream;
pub mod worker;

pub use manager::UsbAccessoryManager;
pub use worker::{HostEvent, HotplugDevice, spawn_usb_event_thread};
