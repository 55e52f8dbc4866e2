//! rust-aoa Host
//!
//! Linux host for Android Open Accessory devices. Switches matching phones
//! into accessory mode, then runs the connection engine against the
//! accessory's bulk endpoints and logs everything the device sends.

mod config;
mod instance;
mod usb;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{EventReceiver, LifecycleEvent, create_event_bridge, setup_logging};
use engine::{AccessoryManager, ConnectionEngine};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use usb::{HostEvent, HotplugDevice, UsbAccessoryManager, spawn_usb_event_thread};

/// Delay before rescanning after a device was asked to re-enumerate
const REENUMERATION_DELAY: Duration = Duration::from_secs(1);

type Engine = ConnectionEngine<UsbAccessoryManager>;

#[derive(Parser, Debug)]
#[command(name = "aoa-host")]
#[command(
    author,
    version,
    about = "AOA Host - Talk to Android devices in accessory mode"
)]
#[command(long_about = "
Host side of the Android Open Accessory protocol. Devices matching the
configured filters are switched into accessory mode; the first accessory
found is opened and read until it goes away.

EXAMPLES:
    # Run with default config
    aoa-host

    # Switch a Samsung phone (VID 04e8) into accessory mode and run
    aoa-host --vid 04e8

    # List USB devices and their accessory status
    aoa-host --list

    # Run with debug logging
    aoa-host --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/aoa-host/host.toml
    3. /etc/aoa-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list: bool,

    /// Switch the device with this vendor ID (hex, optionally VID/PID) into accessory mode
    #[arg(long, value_name = "VID", value_parser = parse_vendor_id)]
    vid: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Parse `04e8`, `0x04e8` or `04e8/6860`; a product ID part is ignored
fn parse_vendor_id(value: &str) -> std::result::Result<u16, String> {
    let vendor = value.split('/').next().unwrap_or_default().trim();
    let hex = vendor
        .trim_start_matches("0x")
        .trim_start_matches("0X");

    if hex.is_empty() || hex.len() > 4 {
        return Err(format!("'{}' is not a 16-bit hex vendor ID", value));
    }
    u16::from_str_radix(hex, 16).map_err(|_| format!("'{}' is not a hex vendor ID", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = config::HostConfig::default();
        let path = config::HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => config::load_config(path).context("Failed to load configuration")?,
        None => config::HostConfig::load_or_default(),
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-aoa Host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let manager = Arc::new(
        UsbAccessoryManager::new(config.host.filters.clone(), config.accessory.clone())
            .context("Failed to initialize USB context")?,
    );

    if args.list {
        return list_devices_mode(&manager);
    }

    let lock = instance::InstanceLock::acquire(&config.lock_path())
        .context("Failed to take the single-instance lock")?;
    debug!("Instance lock: {}", lock.path().display());

    if let Some(vendor_id) = args.vid {
        let handshake = Arc::clone(&manager);
        let version = tokio::task::spawn_blocking(move || handshake.switch_vendor(vendor_id))
            .await
            .context("Handshake task failed")?
            .map_err(|e| anyhow!("Accessory handshake with VID {:04x} failed: {}", vendor_id, e))?;
        if version.is_some() {
            tokio::time::sleep(REENUMERATION_DELAY).await;
        }
    }

    run_host(config, manager).await
}

/// List USB devices and exit
fn list_devices_mode(manager: &UsbAccessoryManager) -> Result<()> {
    let devices = manager.summaries().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let status = if device.accessory_mode {
            "accessory mode"
        } else if device.switchable {
            "matches filters"
        } else {
            "-"
        };
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}  {}",
            device.vendor_id, device.product_id, device.bus, device.address, status
        );
    }

    Ok(())
}

/// Run until Ctrl+C
async fn run_host(config: config::HostConfig, manager: Arc<UsbAccessoryManager>) -> Result<()> {
    let (event_tx, event_rx) = create_event_bridge(config.host.event_capacity);
    let engine = ConnectionEngine::new(
        Arc::clone(&manager),
        Arc::new(event_tx),
        config.engine.engine_config(),
    );

    let (host_tx, host_rx) = async_channel::bounded(config.host.event_capacity);
    let usb_thread = spawn_usb_event_thread(manager.context().clone(), host_tx)
        .context("Failed to spawn USB event thread")?;

    // Devices already attached at startup
    let startup = Arc::clone(&manager);
    let switched = tokio::task::spawn_blocking(move || startup.switch_matching_devices())
        .await
        .context("Startup scan failed")?;
    if switched > 0 {
        info!("Switched {} device(s) into accessory mode", switched);
        tokio::time::sleep(REENUMERATION_DELAY).await;
    }
    engine.notify_device_available(manager.accessories());

    let mut heartbeat = tokio::time::interval(
        config.heartbeat.interval().max(Duration::from_millis(1)),
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let heartbeat_busy = Arc::new(AtomicBool::new(false));

    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = host_rx.recv() => {
                match event {
                    Ok(event) => handle_host_event(event, &manager, &engine),
                    Err(_) => {
                        warn!("USB event thread exited");
                        break;
                    }
                }
            }
            event = recv_lifecycle(&event_rx) => {
                match event {
                    Some(event) => log_lifecycle_event(&event),
                    None => break,
                }
            }
            _ = heartbeat.tick(), if config.heartbeat.enabled => {
                send_heartbeat(&engine, config.heartbeat.value, &heartbeat_busy);
            }
        }
    }

    stop_engine(&engine, &event_rx).await;

    info!("Shutting down USB subsystem...");
    usb_thread.stop();

    Ok(())
}

/// Shut the engine down and wait for its reader
///
/// The bridge keeps being drained while joining: a reader blocked on a full
/// channel never gets back to its termination check otherwise.
async fn stop_engine<M: AccessoryManager>(engine: &ConnectionEngine<M>, events: &EventReceiver) {
    engine.shutdown();

    let reader = engine.clone();
    let mut join = tokio::task::spawn_blocking(move || reader.join_reader());
    let mut draining = true;
    loop {
        tokio::select! {
            result = &mut join => {
                if let Err(e) = result {
                    error!("Failed to join accessory reader: {}", e);
                }
                break;
            }
            event = events.recv_event(), if draining => {
                match event {
                    Ok(event) => log_lifecycle_event(&event),
                    Err(_) => draining = false,
                }
            }
        }
    }

    // Whatever the reader emitted after the last receive
    while let Some(event) = events.try_recv_event() {
        log_lifecycle_event(&event);
    }
}

async fn recv_lifecycle(events: &EventReceiver) -> Option<LifecycleEvent> {
    match events.recv_event().await {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Lifecycle channel closed: {}", e);
            None
        }
    }
}

fn handle_host_event(event: HostEvent, manager: &Arc<UsbAccessoryManager>, engine: &Engine) {
    match event {
        HostEvent::Arrived(device) if device.is_accessory() => {
            info!(
                "Accessory arrived on bus {:03} device {:03}",
                device.bus, device.address
            );
            engine.notify_device_available(manager.accessories());
        }
        HostEvent::Arrived(device)
            if manager.is_switch_candidate(device.vendor_id, device.product_id) =>
        {
            switch_arrived_device(device, manager, engine);
        }
        HostEvent::Arrived(device) => {
            debug!(
                "Ignoring {:04x}:{:04x} (not matched by filters)",
                device.vendor_id, device.product_id
            );
        }
        HostEvent::Left(device) if device.is_accessory() => {
            manager.forget(device.bus, device.address);

            let is_candidate = engine
                .candidate()
                .is_none_or(|c| c.location() == (device.bus, device.address));
            if is_candidate {
                engine.on_device_detached();
            }
        }
        HostEvent::Left(device) => {
            debug!(
                "Device {:04x}:{:04x} left",
                device.vendor_id, device.product_id
            );
        }
    }
}

/// Run the handshake off the runtime, then rescan for the re-enumerated accessory
fn switch_arrived_device(device: HotplugDevice, manager: &Arc<UsbAccessoryManager>, engine: &Engine) {
    let manager = Arc::clone(manager);
    let engine = engine.clone();

    tokio::spawn(async move {
        let handshake = Arc::clone(&manager);
        let result =
            tokio::task::spawn_blocking(move || handshake.switch_at(device.bus, device.address))
                .await;

        match result {
            Ok(Ok(version)) => {
                debug!("Device accepted accessory protocol v{}", version);
                tokio::time::sleep(REENUMERATION_DELAY).await;
                engine.notify_device_available(manager.accessories());
            }
            Ok(Err(e)) => warn!(
                "Accessory handshake failed for {:04x}:{:04x}: {}",
                device.vendor_id, device.product_id, e
            ),
            Err(e) => error!("Handshake task failed: {}", e),
        }
    });
}

fn log_lifecycle_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::ConnectionEstablished => info!("Accessory connected"),
        LifecycleEvent::DeviceDisconnected => info!("Accessory unplugged"),
        LifecycleEvent::ConnectionClosed => info!("Accessory connection closed"),
        LifecycleEvent::DataReceived { data } => {
            info!("Received {} bytes: {:02x?}", data.len(), &data[..]);
        }
    }
}

/// Write the heartbeat byte without blocking the runtime
///
/// A tick is skipped while the previous write is still in flight.
fn send_heartbeat(engine: &Engine, value: u8, busy: &Arc<AtomicBool>) {
    if !engine.is_connected() || busy.swap(true, Ordering::AcqRel) {
        return;
    }

    let engine = engine.clone();
    let busy = Arc::clone(busy);
    tokio::task::spawn_blocking(move || {
        engine.write(&[value]);
        busy.store(false, Ordering::Release);
    });
}
