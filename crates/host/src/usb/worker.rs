//! USB event thread
//!
//! Dedicated thread that pumps libusb events so hot-plug callbacks fire.
//! Arrivals and departures are forwarded to the Tokio runtime over an async
//! channel; the callback itself never blocks.

use async_channel::Sender;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::usb::aoa::is_accessory_mode;

/// Identity of a hot-plugged device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugDevice {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl HotplugDevice {
    fn from_device<T: UsbContext>(device: &Device<T>) -> Option<Self> {
        let desc = device.device_descriptor().ok()?;
        Some(Self {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
        })
    }

    pub fn is_accessory(&self) -> bool {
        is_accessory_mode(self.vendor_id, self.product_id)
    }
}

/// Hot-plug notifications for the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Arrived(HotplugDevice),
    Left(HotplugDevice),
}

/// Hot-plug callback handler
struct HotplugForwarder {
    events: Sender<HostEvent>,
}

impl HotplugForwarder {
    fn forward(&self, event: HostEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping hot-plug event {:?}: {}", event, e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some(info) = HotplugDevice::from_device(&device) {
            self.forward(HostEvent::Arrived(info));
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if let Some(info) = HotplugDevice::from_device(&device) {
            self.forward(HostEvent::Left(info));
        }
    }
}

/// Running USB event thread
pub struct UsbEventThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UsbEventThread {
    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("USB event thread panicked");
        }
    }
}

/// Spawn the USB event thread
///
/// Hot-plug callbacks are registered on the thread itself and deregistered
/// when it exits.
pub fn spawn_usb_event_thread(
    context: Context,
    events: Sender<HostEvent>,
) -> std::io::Result<UsbEventThread> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("usb-events".to_string())
        .spawn(move || run_event_loop(context, events, thread_stop))?;

    Ok(UsbEventThread {
        stop,
        handle: Some(handle),
    })
}

fn run_event_loop(context: Context, events: Sender<HostEvent>, stop: Arc<AtomicBool>) {
    info!("USB event thread started");

    let _registration = if rusb::has_hotplug() {
        match HotplugBuilder::new()
            .enumerate(false)
            .register::<Context, _>(
                &context,
                Box::new(HotplugForwarder {
                    events: events.clone(),
                }),
            )
        {
            Ok(registration) => {
                debug!("Hot-plug callbacks registered");
                Some(registration)
            }
            Err(e) => {
                warn!("Failed to register hot-plug callbacks: {}", e);
                None
            }
        }
    } else {
        warn!("libusb has no hot-plug support; only devices present at startup are used");
        None
    };

    // Timeout keeps the stop flag observed while no events arrive
    let timeout = Duration::from_millis(100);

    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(timeout)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(timeout);
            }
        }
    }

    // Receivers see the channel close only once the thread stops
    drop(events);
    info!("USB event thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hotplug_device_accessory_detection() {
        let accessory = HotplugDevice {
            bus: 1,
            address: 4,
            vendor_id: 0x18D1,
            product_id: 0x2D01,
        };
        let phone = HotplugDevice {
            vendor_id: 0x04E8,
            product_id: 0x6860,
            ..accessory
        };

        assert!(accessory.is_accessory());
        assert!(!phone.is_accessory());
    }

    #[test]
    fn test_forwarder_drops_when_full() {
        let (tx, rx) = async_channel::bounded(1);
        let forwarder = HotplugForwarder { events: tx };
        let device = HotplugDevice {
            bus: 1,
            address: 2,
            vendor_id: 0x18D1,
            product_id: 0x2D00,
        };

        forwarder.forward(HostEvent::Arrived(device));
        forwarder.forward(HostEvent::Left(device));

        assert_eq!(rx.try_recv().ok(), Some(HostEvent::Arrived(device)));
        assert!(rx.try_recv().is_err());
    }
}
