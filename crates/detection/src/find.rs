//! One-shot device search
//!
//! Every search runs a fresh enumeration on its own `usb-find` thread and
//! never touches monitoring state.

use crate::registry::DeviceRegistry;
use crate::watcher::PlatformWatcher;
use common::{DeviceFilter, DeviceRecord, Error, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Filtered snapshot queries against a [`PlatformWatcher`]
#[derive(Clone)]
pub struct FindService {
    watcher: Arc<dyn PlatformWatcher>,
}

impl FindService {
    pub fn new(watcher: Arc<dyn PlatformWatcher>) -> Self {
        Self { watcher }
    }

    /// Find connected devices matching `filter`
    ///
    /// Results are sorted by location id, then key.
    pub async fn find(&self, filter: DeviceFilter) -> Result<Vec<DeviceRecord>> {
        let (tx, rx) = oneshot::channel();
        self.spawn(filter, move |result| {
            // Receiver gone means the caller stopped waiting
            let _ = tx.send(result);
        })?;

        rx.await
            .map_err(|_| Error::Channel("find worker exited without a result".to_string()))?
    }

    /// Find connected devices matching `filter`, reporting through `callback`
    ///
    /// The callback runs once, on the worker thread. An error is returned
    /// only when the worker could not be started, in which case the callback
    /// is never called.
    pub fn find_with_callback(
        &self,
        filter: DeviceFilter,
        callback: impl FnOnce(Result<Vec<DeviceRecord>>) + Send + 'static,
    ) -> Result<()> {
        self.spawn(filter, callback)
    }

    fn spawn(
        &self,
        filter: DeviceFilter,
        complete: impl FnOnce(Result<Vec<DeviceRecord>>) + Send + 'static,
    ) -> Result<()> {
        let watcher = Arc::clone(&self.watcher);
        std::thread::Builder::new()
            .name("usb-find".to_string())
            .spawn(move || complete(search(watcher.as_ref(), &filter)))?;
        Ok(())
    }
}

/// Enumerate through `watcher` and return the sorted matches
pub fn search(watcher: &dyn PlatformWatcher, filter: &DeviceFilter) -> Result<Vec<DeviceRecord>> {
    let devices = watcher.enumerate().map_err(|e| {
        error!("Find failed: {}", e);
        match e {
            Error::Enumeration(_) => e,
            other => Error::Enumeration(other.to_string()),
        }
    })?;

    let registry = DeviceRegistry::new();
    for record in devices {
        registry.insert(record);
    }

    let mut matches = registry.snapshot(filter);
    matches.sort_by(|a, b| {
        a.location_id()
            .cmp(&b.location_id())
            .then_with(|| a.key().cmp(b.key()))
    });
    debug!(
        "Find {} matched {} of {} devices",
        filter,
        matches.len(),
        registry.len()
    );
    Ok(matches)
}
