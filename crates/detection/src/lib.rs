//! USB device detection and hot-plug monitoring
//!
//! This crate keeps a consistent view of the connected USB devices while a
//! platform watcher reports attach/detach events from its own thread, and
//! hands those events to consumer handlers on a single dispatch thread.
//!
//! # Modules
//!
//! - `registry`: thread-safe store of known devices
//! - `watcher`: platform watcher trait, libusb and simulated implementations
//! - `monitor`: start/stop state machine driving the registry
//! - `bridge`: ordered cross-thread delivery to consumer handlers
//! - `find`: one-shot filtered device search
//! - `detector`: the [`UsbDetection`] facade

pub mod bridge;
pub mod detector;
pub mod find;
pub mod monitor;
pub mod registry;
pub mod watcher;

pub use bridge::{NotificationBridge, NotificationKind};
pub use detector::UsbDetection;
pub use find::FindService;
pub use monitor::{MonitorController, MonitorState};
pub use registry::DeviceRegistry;
pub use watcher::{
    EventSink, LibusbWatcher, PlatformWatcher, SimulatedWatcher, Subscription, WatcherEvent,
    WatcherOptions,
};
