//! In-memory platform watcher
//!
//! Stands in for the OS in tests and demos. `plug`/`unplug` change the
//! simulated bus and raise events on the calling thread, which plays the
//! role of the OS notification thread.

use super::{EventSink, PlatformWatcher, Subscription, WatcherEvent};
use common::{DeviceKey, DeviceRecord, Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct SimState {
    devices: BTreeMap<DeviceKey, DeviceRecord>,
    sinks: HashMap<u64, EventSink>,
    next_subscription: u64,
    subscribe_count: usize,
    fail_next_subscribe: Option<String>,
    fail_enumeration: Option<String>,
    during_enumerate: Vec<WatcherEvent>,
    leaky: bool,
}

/// Simulated USB bus
#[derive(Clone, Default)]
pub struct SimulatedWatcher {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with `records` already connected
    pub fn with_devices(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let watcher = Self::new();
        {
            let mut state = watcher.lock();
            for record in records {
                state.devices.insert(record.key().clone(), record);
            }
        }
        watcher
    }

    /// Connect a device and raise `Attached`
    pub fn plug(&self, record: DeviceRecord) {
        let sinks = {
            let mut state = self.lock();
            state.devices.insert(record.key().clone(), record.clone());
            state.sinks()
        };
        emit(&sinks, WatcherEvent::Attached(record));
    }

    /// Disconnect a device and raise `Detached`
    ///
    /// Returns false if no device had that key.
    pub fn unplug(&self, key: &DeviceKey) -> bool {
        let sinks = {
            let mut state = self.lock();
            if state.devices.remove(key).is_none() {
                return false;
            }
            state.sinks()
        };
        emit(&sinks, WatcherEvent::Detached(key.clone()));
        true
    }

    /// Raise an event without touching the simulated bus
    pub fn emit(&self, event: WatcherEvent) {
        let sinks = self.lock().sinks();
        emit(&sinks, event);
    }

    /// Simulate the event source dying
    pub fn fail(&self, message: &str) {
        self.emit(WatcherEvent::Failed(message.to_string()));
    }

    /// Make the next `subscribe` call fail with `WatcherInit`
    pub fn fail_next_subscribe(&self, message: &str) {
        self.lock().fail_next_subscribe = Some(message.to_string());
    }

    /// Make `enumerate` fail (or succeed again with `None`)
    pub fn fail_enumeration(&self, message: Option<&str>) {
        self.lock().fail_enumeration = message.map(str::to_string);
    }

    /// Raise `event` from inside the next `enumerate`, after the device
    /// list has been taken
    ///
    /// `Attached`/`Detached` also change the simulated bus, modelling a
    /// device that is plugged or unplugged while enumeration runs.
    pub fn during_next_enumerate(&self, event: WatcherEvent) {
        self.lock().during_enumerate.push(event);
    }

    /// Keep sending events to released subscribers
    ///
    /// Models an OS source that still fires after unsubscription.
    pub fn set_leaky(&self, leaky: bool) {
        self.lock().leaky = leaky;
    }

    /// Number of subscriptions still receiving events
    pub fn active_subscriptions(&self) -> usize {
        self.lock().sinks.len()
    }

    /// Total number of successful `subscribe` calls
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribe_count
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SimState {
    fn sinks(&self) -> Vec<EventSink> {
        self.sinks.values().cloned().collect()
    }
}

// Sinks run outside the state lock so they may call back into the watcher.
fn emit(sinks: &[EventSink], event: WatcherEvent) {
    for sink in sinks {
        sink(event.clone());
    }
}

impl PlatformWatcher for SimulatedWatcher {
    fn enumerate(&self) -> Result<Vec<DeviceRecord>> {
        let (devices, racing, sinks) = {
            let mut state = self.lock();
            if let Some(message) = &state.fail_enumeration {
                return Err(Error::Enumeration(message.clone()));
            }
            let devices: Vec<DeviceRecord> = state.devices.values().cloned().collect();
            let racing = std::mem::take(&mut state.during_enumerate);
            for event in &racing {
                match event {
                    WatcherEvent::Attached(record) => {
                        state.devices.insert(record.key().clone(), record.clone());
                    }
                    WatcherEvent::Detached(key) => {
                        state.devices.remove(key);
                    }
                    WatcherEvent::Failed(_) => {}
                }
            }
            (devices, racing, state.sinks())
        };

        for event in racing {
            emit(&sinks, event);
        }
        Ok(devices)
    }

    fn subscribe(&self, sink: EventSink) -> Result<Subscription> {
        let id = {
            let mut state = self.lock();
            if let Some(message) = state.fail_next_subscribe.take() {
                return Err(Error::WatcherInit(message));
            }
            let id = state.next_subscription;
            state.next_subscription += 1;
            state.subscribe_count += 1;
            state.sinks.insert(id, sink);
            id
        };
        debug!("Simulated subscription {} created", id);

        let state = Arc::clone(&self.state);
        Ok(Subscription::new(move || {
            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !state.leaky {
                state.sinks.remove(&id);
            }
            debug!("Simulated subscription {} released", id);
        }))
    }
}
