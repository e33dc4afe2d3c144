//! Host facade
//!
//! [`UsbDetection`] ties a watcher, the monitor and the notification bridge
//! together behind the find / register / start / stop surface a host
//! application uses.

use crate::bridge::NotificationBridge;
use crate::find::FindService;
use crate::monitor::MonitorController;
use crate::watcher::{LibusbWatcher, PlatformWatcher, WatcherOptions};
use common::{DeviceFilter, DeviceRecord, Result};
use std::sync::Arc;
use tracing::info;

/// USB device detection and hot-plug monitoring
///
/// # Example
///
/// ```no_run
/// use detection::{UsbDetection, WatcherOptions};
/// use common::DeviceFilter;
///
/// # async fn run() -> common::Result<()> {
/// let usb = UsbDetection::with_libusb(WatcherOptions::default())?;
/// usb.register_added(|device| println!("added: {}", device));
/// usb.register_removed(|device| println!("removed: {}", device));
/// usb.start_monitoring()?;
///
/// let keyboards = usb.find(DeviceFilter::vendor(0x046d)).await?;
/// println!("{} Logitech devices", keyboards.len());
///
/// usb.stop_monitoring()?;
/// # Ok(())
/// # }
/// ```
pub struct UsbDetection {
    monitor: MonitorController,
    finder: FindService,
    bridge: Arc<NotificationBridge>,
}

impl UsbDetection {
    pub fn new(watcher: Arc<dyn PlatformWatcher>) -> Result<Self> {
        let bridge = Arc::new(NotificationBridge::new()?);
        Ok(Self {
            monitor: MonitorController::new(Arc::clone(&watcher), Arc::clone(&bridge)),
            finder: FindService::new(watcher),
            bridge,
        })
    }

    /// Create a detector backed by libusb
    pub fn with_libusb(options: WatcherOptions) -> Result<Self> {
        let watcher = LibusbWatcher::new(options)?;
        info!("Using libusb watcher");
        Self::new(Arc::new(watcher))
    }

    /// Find connected devices matching `filter`
    pub async fn find(&self, filter: DeviceFilter) -> Result<Vec<DeviceRecord>> {
        self.finder.find(filter).await
    }

    /// Find connected devices, reporting on a worker thread through `callback`
    pub fn find_with_callback(
        &self,
        filter: DeviceFilter,
        callback: impl FnOnce(Result<Vec<DeviceRecord>>) + Send + 'static,
    ) -> Result<()> {
        self.finder.find_with_callback(filter, callback)
    }

    /// Handler for devices attached while monitoring
    pub fn register_added(&self, handler: impl Fn(&DeviceRecord) + Send + Sync + 'static) {
        self.bridge.register_added(handler);
    }

    /// Handler for devices detached while monitoring
    pub fn register_removed(&self, handler: impl Fn(&DeviceRecord) + Send + Sync + 'static) {
        self.bridge.register_removed(handler);
    }

    /// Handler for monitoring failures after a successful start
    pub fn register_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.bridge.register_error(handler);
    }

    pub fn start_monitoring(&self) -> Result<()> {
        self.monitor.start()
    }

    pub fn stop_monitoring(&self) -> Result<()> {
        self.monitor.stop()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// Devices known to the running monitor, sorted by location id then key
    ///
    /// Empty while monitoring is stopped.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices = self.monitor.devices(&DeviceFilter::any());
        devices.sort_by(|a, b| {
            a.location_id()
                .cmp(&b.location_id())
                .then_with(|| a.key().cmp(b.key()))
        });
        devices
    }
}
