//! Bulk-endpoint duplex stream
//!
//! Interface 0 of an accessory-mode device carries one bulk IN and one bulk
//! OUT endpoint. Reads are issued in short slices so that `close` from
//! another thread is observed within one slice; libusb offers no way to
//! abort a synchronous transfer. `close` never waits for a slice: when a read
//! is in flight the interface is released by the reader or on drop.

use crate::usb::aoa::map_rusb_error;
use common::{Error, Result};
use engine::AccessoryStream;
use parking_lot::Mutex;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Length of one blocking read slice
const READ_SLICE: Duration = Duration::from_millis(100);

/// Timeout for one bulk OUT transfer
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const CONFIGURATION_ATTEMPTS: u32 = 5;
const CONFIGURATION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Interface and bulk endpoints used by the accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

/// Duplex stream over an opened accessory
pub struct UsbAccessoryStream {
    handle: DeviceHandle<Context>,
    endpoints: BulkEndpoints,
    kernel_driver_detached: bool,
    closed: AtomicBool,
    /// Interface released and kernel driver restored
    released: AtomicBool,
    /// Held for the duration of each read slice
    read_lock: Mutex<()>,
}

impl UsbAccessoryStream {
    /// Open `device`, select its configuration and claim the accessory interface
    pub fn open(device: &Device<Context>) -> Result<Self> {
        let handle = device.open().map_err(map_rusb_error)?;
        debug!(
            "Opened device on bus {:03} address {:03}",
            device.bus_number(),
            device.address()
        );

        set_configuration_with_retry(device, &handle)?;
        let endpoints = find_bulk_endpoints(device)?;
        debug!("Using {:?}", endpoints);

        let kernel_driver_detached = match handle.kernel_driver_active(endpoints.interface) {
            Ok(true) => match handle.detach_kernel_driver(endpoints.interface) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        endpoints.interface, e
                    );
                    false
                }
            },
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    endpoints.interface, e
                );
                false
            }
        };

        handle
            .claim_interface(endpoints.interface)
            .map_err(map_rusb_error)?;
        debug!("Claimed interface {}", endpoints.interface);

        Ok(Self {
            handle,
            endpoints,
            kernel_driver_detached,
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            read_lock: Mutex::new(()),
        })
    }

    /// Release the interface and reattach the kernel driver, once
    fn release_interface(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let interface = self.endpoints.interface;
        let released = self.handle.release_interface(interface);
        if let Err(e) = &released {
            warn!("Unable to release interface {}: {}", interface, e);
        }

        if self.kernel_driver_detached
            && let Err(e) = self.handle.attach_kernel_driver(interface)
        {
            warn!(
                "Unable to reattach kernel driver to interface {}: {}",
                interface, e
            );
        }

        debug!("Closed accessory stream on interface {}", interface);
        released.map_err(map_rusb_error)
    }
}

impl Drop for UsbAccessoryStream {
    fn drop(&mut self) {
        if let Err(e) = self.release_interface() {
            debug!("Release on drop failed: {}", e);
        }
    }
}

impl AccessoryStream for UsbAccessoryStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let _slice = self.read_lock.lock();
            if self.closed.load(Ordering::Acquire) {
                if let Err(e) = self.release_interface() {
                    debug!("Release after close failed: {}", e);
                }
                return Err(Error::Closed);
            }

            match self
                .handle
                .read_bulk(self.endpoints.endpoint_in, buf, READ_SLICE)
            {
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(map_rusb_error(e)),
            }
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            let written = self
                .handle
                .write_bulk(self.endpoints.endpoint_out, &data[offset..], WRITE_TIMEOUT)
                .map_err(map_rusb_error)?;
            if written == 0 {
                return Err(Error::Io(std::io::Error::from(
                    std::io::ErrorKind::WriteZero,
                )));
            }
            offset += written;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.read_lock.try_lock() {
            Some(_slice) => self.release_interface(),
            None => {
                debug!("Read slice in flight, reader releases the interface");
                Ok(())
            }
        }
    }
}

/// Select the first configuration, retrying while the device settles
fn set_configuration_with_retry(
    device: &Device<Context>,
    handle: &DeviceHandle<Context>,
) -> Result<()> {
    let config = device
        .config_descriptor(0)
        .map_err(map_rusb_error)?
        .number();

    let mut attempt = 1;
    loop {
        match handle.set_active_configuration(config) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < CONFIGURATION_ATTEMPTS => {
                warn!(
                    "Unable to set configuration {} (attempt {}): {}, retrying",
                    config, attempt, e
                );
                attempt += 1;
                thread::sleep(CONFIGURATION_RETRY_DELAY);
            }
            Err(e) => {
                // The configuration may already be active and held by the kernel
                warn!("Giving up on setting configuration {}: {}", config, e);
                return Ok(());
            }
        }
    }
}

/// Locate the bulk endpoint pair on interface 0
pub fn find_bulk_endpoints(device: &Device<Context>) -> Result<BulkEndpoints> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .map_err(map_rusb_error)?;

    let interface = config
        .interfaces()
        .next()
        .ok_or_else(|| Error::Usb("Accessory has no interfaces".to_string()))?;
    let descriptor = interface
        .descriptors()
        .next()
        .ok_or_else(|| Error::Usb("Accessory interface has no descriptor".to_string()))?;

    let bulk = |direction: Direction| {
        descriptor
            .endpoint_descriptors()
            .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == direction)
            .map(|ep| ep.address())
    };

    match (bulk(Direction::In), bulk(Direction::Out)) {
        (Some(endpoint_in), Some(endpoint_out)) => Ok(BulkEndpoints {
            interface: interface.number(),
            endpoint_in,
            endpoint_out,
        }),
        _ => Err(Error::Usb(format!(
            "Interface {} lacks a bulk endpoint pair",
            interface.number()
        ))),
    }
}
