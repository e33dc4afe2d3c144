//! Device registry
//!
//! Thread-safe keyed store of [`DeviceRecord`]s. Every operation runs under a
//! single mutex, so per-key insert/remove order is total and snapshots never
//! observe a half-applied mutation. Only clones leave the registry.

use common::{DeviceFilter, DeviceKey, DeviceRecord};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Registry of currently known devices, keyed by [`DeviceKey`]
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceKey, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record, replacing any record under the same key
    ///
    /// Returns the replaced record, if there was one.
    pub fn insert(&self, record: DeviceRecord) -> Option<DeviceRecord> {
        let key = record.key().clone();
        let previous = self.lock().insert(key, record);
        trace!(replaced = previous.is_some(), "registry insert");
        previous
    }

    /// Remove a record, handing it back by value
    ///
    /// `None` means the key was not present, which is a normal outcome.
    pub fn remove(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.lock().remove(key)
    }

    pub fn lookup(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Copy every record matching `filter` at a single point in time
    ///
    /// Result order is unspecified.
    pub fn snapshot(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.lock()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Drop every record, returning how many were held
    pub fn clear(&self) -> usize {
        let mut devices = self.lock();
        let count = devices.len();
        devices.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // No operation leaves the map half-mutated, so a poisoned lock still
    // guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, DeviceRecord>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
