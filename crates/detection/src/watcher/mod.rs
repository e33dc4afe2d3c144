//! Platform watcher abstraction
//!
//! The detection core never talks to the OS directly. It consumes a
//! [`PlatformWatcher`], which provides an initial device list and a live
//! stream of attach/detach events raised on the watcher's own thread.
//!
//! Implementations:
//! - [`libusb::LibusbWatcher`]: libusb hot-plug via `rusb`
//! - [`simulated::SimulatedWatcher`]: in-memory device set for tests and demos

pub mod libusb;
pub mod simulated;

use common::{DeviceKey, DeviceRecord, Result};
use std::sync::Arc;

pub use libusb::{LibusbWatcher, WatcherOptions};
pub use simulated::SimulatedWatcher;

/// Event raised by a watcher on its notification thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// A device was connected
    Attached(DeviceRecord),
    /// The device with this key was disconnected
    Detached(DeviceKey),
    /// The event source died; no further events will follow
    Failed(String),
}

/// Callback receiving watcher events
pub type EventSink = Arc<dyn Fn(WatcherEvent) + Send + Sync>;

/// Source of USB device information
pub trait PlatformWatcher: Send + Sync {
    /// Enumerate the devices connected right now
    fn enumerate(&self) -> Result<Vec<DeviceRecord>>;

    /// Begin live monitoring
    ///
    /// `sink` is called from the watcher's own thread until the returned
    /// [`Subscription`] is released.
    fn subscribe(&self, sink: EventSink) -> Result<Subscription>;
}

/// Live subscription guard
///
/// Releasing (explicitly or by drop) tears down the OS-level subscription
/// and only returns once the notification thread has finished.
#[must_use = "dropping a Subscription releases it immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the subscription and wait for the notification thread
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
