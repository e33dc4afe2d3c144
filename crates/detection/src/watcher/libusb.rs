//! libusb-backed platform watcher
//!
//! Enumerates devices through a shared `rusb` context and watches hot-plug
//! events on a dedicated `usb-hotplug` thread that drives
//! `handle_events()`. Hot-plug callbacks only queue the raw device; records
//! are built after `handle_events()` returns, because opening a device
//! (needed for string descriptors) is not allowed inside the callback.

use super::{EventSink, PlatformWatcher, Subscription, WatcherEvent};
use common::{DeviceFilter, DeviceKey, DeviceRecord, Error, Result};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// USB vendor id of the Linux Foundation (root hubs)
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// USB class code for hubs
const HUB_CLASS: u8 = 9;

/// Consecutive event loop errors tolerated before the stream is declared dead
const MAX_EVENT_ERRORS: u32 = 10;

/// Options for [`LibusbWatcher`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherOptions {
    /// Timeout for each `handle_events()` call; bounds stop latency
    pub poll_interval_ms: u64,
    /// Open devices to read manufacturer/product/serial strings
    pub read_strings: bool,
    /// Hide Linux root hubs
    pub skip_root_hubs: bool,
    /// Only report devices matching one of these `VID:PID` patterns
    pub filters: Vec<String>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            read_strings: true,
            skip_root_hubs: false,
            filters: Vec::new(),
        }
    }
}

/// Parsed form of [`WatcherOptions`], shared with the hot-plug thread
#[derive(Debug)]
struct Settings {
    poll_interval: Duration,
    read_strings: bool,
    skip_root_hubs: bool,
    filters: Vec<DeviceFilter>,
}

impl Settings {
    fn from_options(options: &WatcherOptions) -> Result<Self> {
        let filters = options
            .filters
            .iter()
            .map(|f| DeviceFilter::parse(f))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            poll_interval: Duration::from_millis(options.poll_interval_ms.max(1)),
            read_strings: options.read_strings,
            skip_root_hubs: options.skip_root_hubs,
            filters,
        })
    }

    fn is_allowed(&self, vendor_id: u16, product_id: u16) -> bool {
        self.filters.is_empty()
            || self
                .filters
                .iter()
                .any(|f| f.matches_ids(vendor_id, product_id))
    }
}

/// Platform watcher backed by libusb
pub struct LibusbWatcher {
    context: Context,
    settings: Arc<Settings>,
}

impl LibusbWatcher {
    pub fn new(options: WatcherOptions) -> Result<Self> {
        let settings = Settings::from_options(&options)?;
        let context = Context::new()
            .map_err(|e| Error::Usb(format!("Failed to create USB context: {}", e)))?;

        Ok(Self {
            context,
            settings: Arc::new(settings),
        })
    }
}

impl PlatformWatcher for LibusbWatcher {
    fn enumerate(&self) -> Result<Vec<DeviceRecord>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Enumeration(format!("Failed to list USB devices: {}", e)))?;

        let records: Vec<DeviceRecord> = devices
            .iter()
            .filter_map(|device| build_record(&device, &self.settings))
            .collect();

        debug!("Enumerated {} devices", records.len());
        Ok(records)
    }

    fn subscribe(&self, sink: EventSink) -> Result<Subscription> {
        if !rusb::has_hotplug() {
            return Err(Error::WatcherInit(
                "libusb was built without hot-plug support".to_string(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = async_channel::bounded::<Result<()>>(1);

        let thread = {
            let context = self.context.clone();
            let settings = Arc::clone(&self.settings);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("usb-hotplug".to_string())
                .spawn(move || run_event_loop(context, settings, sink, stop, ready_tx))
                .map_err(|e| {
                    Error::WatcherInit(format!("Failed to spawn hot-plug thread: {}", e))
                })?
        };

        // The thread reports whether the hot-plug registration succeeded.
        let registered = ready_rx
            .recv_blocking()
            .map_err(|_| Error::WatcherInit("Hot-plug thread exited during setup".to_string()));

        if let Err(e) = registered.and_then(|r| r) {
            let _ = thread.join();
            return Err(e);
        }

        info!("USB hot-plug monitoring started");

        Ok(Subscription::new(move || {
            stop.store(true, Ordering::Release);
            if thread.thread().id() == std::thread::current().id() {
                warn!("Hot-plug subscription released from its own thread; not joining");
                return;
            }
            if let Err(e) = thread.join() {
                error!("Hot-plug thread panicked: {:?}", e);
            }
            info!("USB hot-plug monitoring stopped");
        }))
    }
}

/// Raw hot-plug change queued by the libusb callback
enum HotplugChange {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

/// Hot-plug callback handler
///
/// Only queues devices; the event loop turns them into records.
struct HotplugCallback {
    pending: Arc<Mutex<VecDeque<HotplugChange>>>,
}

impl HotplugCallback {
    fn push(&self, change: HotplugChange) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(change);
    }
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugChange::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugChange::Left(device));
    }
}

fn run_event_loop(
    context: Context,
    settings: Arc<Settings>,
    sink: EventSink,
    stop: Arc<AtomicBool>,
    ready: async_channel::Sender<Result<()>>,
) {
    let pending = Arc::new(Mutex::new(VecDeque::new()));
    let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugCallback {
        pending: Arc::clone(&pending),
    });

    // Dropped at the end of this function, deregistering the callback.
    let _registration = match HotplugBuilder::new()
        .enumerate(false)
        .register(context.clone(), callback)
    {
        Ok(registration) => {
            let _ = ready.send_blocking(Ok(()));
            registration
        }
        Err(e) => {
            let _ = ready.send_blocking(Err(Error::WatcherInit(format!(
                "Failed to register hot-plug callback: {}",
                e
            ))));
            return;
        }
    };
    drop(ready);

    let mut consecutive_errors = 0;
    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(settings.poll_interval)) {
            Ok(()) => consecutive_errors = 0,
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("Error handling USB events: {}", e);
                if consecutive_errors >= MAX_EVENT_ERRORS {
                    error!(
                        "USB event loop failed {} times in a row, giving up",
                        consecutive_errors
                    );
                    sink(WatcherEvent::Failed(format!("USB event loop failed: {}", e)));
                    return;
                }
                std::thread::sleep(settings.poll_interval);
            }
        }

        let changes: Vec<HotplugChange> = pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        for change in changes {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match change {
                HotplugChange::Arrived(device) => {
                    if let Some(record) = build_record(&device, &settings) {
                        sink(WatcherEvent::Attached(record));
                    }
                }
                HotplugChange::Left(device) => {
                    sink(WatcherEvent::Detached(device_key(&device)));
                }
            }
        }
    }
}

/// Registry key for a libusb device: bus number and bus address
fn device_key<T: UsbContext>(device: &Device<T>) -> DeviceKey {
    DeviceKey::new(format!("usb-{:03}-{:03}", device.bus_number(), device.address()))
}

/// Encode a bus number and hub port path as a topology id
///
/// Bus number in the top byte, then one nibble per port from the root.
fn location_id(bus: u8, ports: &[u8]) -> u32 {
    let mut id = (bus as u32) << 24;
    for (depth, port) in ports.iter().take(6).enumerate() {
        id |= ((*port as u32) & 0x0f) << (20 - 4 * depth);
    }
    id
}

/// Build a record for `device`, or `None` if it is filtered out or unreadable
fn build_record<T: UsbContext>(device: &Device<T>, settings: &Settings) -> Option<DeviceRecord> {
    let bus = device.bus_number();
    let address = device.address();

    let descriptor = match device.device_descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(
                "Skipping device with unreadable descriptor (bus={}, addr={}): {}",
                bus, address, e
            );
            return None;
        }
    };

    let vendor_id = descriptor.vendor_id();
    let product_id = descriptor.product_id();

    if settings.skip_root_hubs
        && vendor_id == ROOT_HUB_VENDOR_ID
        && descriptor.class_code() == HUB_CLASS
    {
        debug!("Skipping root hub: bus={}, addr={}", bus, address);
        return None;
    }

    if !settings.is_allowed(vendor_id, product_id) {
        debug!(
            "Device ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
            bus, address, vendor_id, product_id
        );
        return None;
    }

    let ports = device.port_numbers().unwrap_or_default();
    let mut builder = DeviceRecord::builder(device_key(device), vendor_id, product_id)
        .location_id(location_id(bus, &ports))
        .device_address(address as u32);

    if settings.read_strings {
        match device.open() {
            Ok(handle) => {
                let read = |index: Option<u8>| {
                    index
                        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                        .unwrap_or_default()
                };
                builder = builder
                    .manufacturer(read(descriptor.manufacturer_string_index()))
                    .device_name(read(descriptor.product_string_index()))
                    .serial_number(read(descriptor.serial_number_string_index()));
            }
            Err(e) => {
                debug!(
                    "Could not open device for strings (bus={}, addr={}): {}",
                    bus, address, e
                );
            }
        }
    }

    Some(builder.build())
}
