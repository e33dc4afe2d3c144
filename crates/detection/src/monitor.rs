//! Monitor lifecycle
//!
//! [`MonitorController`] owns the live watcher subscription and keeps the
//! [`DeviceRegistry`] in step with the bus while monitoring runs.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `start`/`stop` are serialized by a lifecycle lock. Watcher callbacks only
//! take the short state lock, so a stopping thread never waits on a callback
//! that waits on it.
//!
//! Start subscribes before enumerating. Live events seen while starting are
//! applied silently and remembered per key; for those keys the live event
//! wins over the enumeration result, so a device unplugged mid-start is not
//! left behind. Devices attached in between are reported through `devices()`
//! like the rest of the initial set, without an added notification.

use crate::bridge::{NotificationBridge, NotificationKind};
use crate::registry::DeviceRegistry;
use crate::watcher::{EventSink, PlatformWatcher, Subscription, WatcherEvent};
use common::{DeviceFilter, DeviceKey, DeviceRecord, Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Monitoring state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Shared {
    state: Mutex<MonitorState>,
    /// Reason the watcher died while the monitor was starting
    startup_failure: Mutex<Option<String>>,
    /// Last live event per key while starting; `None` marks a detach
    startup_events: Mutex<HashMap<DeviceKey, Option<DeviceRecord>>>,
    registry: Arc<DeviceRegistry>,
    bridge: Arc<NotificationBridge>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_startup_failure(&self) -> Option<String> {
        self.startup_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn startup_events(&self) -> MutexGuard<'_, HashMap<DeviceKey, Option<DeviceRecord>>> {
        self.startup_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle_event(&self, event: WatcherEvent) {
        let mut state = self.state();
        let current = *state;
        match event {
            WatcherEvent::Attached(record) => match current {
                MonitorState::Starting => {
                    self.startup_events()
                        .insert(record.key().clone(), Some(record.clone()));
                    self.registry.insert(record);
                }
                MonitorState::Running => {
                    let key = record.key().clone();
                    if self.registry.insert(record.clone()).is_none() {
                        info!("Device attached: {}", record);
                        self.bridge.deliver(NotificationKind::Added, record);
                    } else {
                        debug!("Refreshed record for {}", key);
                    }
                }
                other => debug!("Ignoring attach of {} while {:?}", record.key(), other),
            },
            WatcherEvent::Detached(key) => match current {
                MonitorState::Starting => {
                    self.registry.remove(&key);
                    self.startup_events().insert(key, None);
                }
                MonitorState::Running => match self.registry.remove(&key) {
                    Some(record) => {
                        info!("Device detached: {}", record);
                        self.bridge.deliver(NotificationKind::Removed, record);
                    }
                    None => debug!("Detach for unknown device {}", key),
                },
                other => debug!("Ignoring detach of {} while {:?}", key, other),
            },
            WatcherEvent::Failed(message) => match current {
                MonitorState::Starting => {
                    warn!("Watcher failed during start: {}", message);
                    *state = MonitorState::Stopped;
                    *self
                        .startup_failure
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message);
                }
                MonitorState::Running => {
                    error!("Monitoring failed: {}", message);
                    *state = MonitorState::Stopped;
                    self.bridge.end_session();
                    self.registry.clear();
                    drop(state);
                    self.bridge.deliver_failure(message);
                }
                other => debug!("Ignoring watcher failure while {:?}: {}", other, message),
            },
        }
    }
}

/// Rolls a half-done start back to `Stopped` unless disarmed
struct StartGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.shared.state() = MonitorState::Stopped;
            self.shared.startup_events().clear();
            self.shared.registry.clear();
        }
    }
}

/// Starts and stops live monitoring
pub struct MonitorController {
    watcher: Arc<dyn PlatformWatcher>,
    shared: Arc<Shared>,
    /// Lifecycle lock; holds the live subscription while one exists
    subscription: Mutex<Option<Subscription>>,
}

impl MonitorController {
    pub fn new(watcher: Arc<dyn PlatformWatcher>, bridge: Arc<NotificationBridge>) -> Self {
        Self {
            watcher,
            shared: Arc::new(Shared {
                state: Mutex::new(MonitorState::Stopped),
                startup_failure: Mutex::new(None),
                startup_events: Mutex::new(HashMap::new()),
                registry: Arc::new(DeviceRegistry::new()),
                bridge,
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Start monitoring
    ///
    /// Subscribes to the watcher, loads the current device set into the
    /// registry and opens a notification session. A no-op when already
    /// running. On failure everything is rolled back and the monitor stays
    /// stopped.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.lifecycle();

        if *self.shared.state() == MonitorState::Running {
            debug!("Monitoring already running");
            return Ok(());
        }

        // Left behind by a watcher failure
        if let Some(stale) = slot.take() {
            debug!("Releasing dead watcher subscription");
            stale.unsubscribe();
        }
        self.shared.registry.clear();
        self.shared.take_startup_failure();
        self.shared.startup_events().clear();

        *self.shared.state() = MonitorState::Starting;
        let mut guard = StartGuard {
            shared: &self.shared,
            armed: true,
        };

        let sink: EventSink = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |event| shared.handle_event(event))
        };
        let subscription = self.watcher.subscribe(sink).map_err(|e| {
            error!("Failed to subscribe to device events: {}", e);
            e
        })?;

        let devices = self.watcher.enumerate().map_err(|e| {
            error!("Failed to enumerate devices: {}", e);
            e
        })?;

        {
            // Events are applied under the state lock, so none can slip in
            // between the check against live events and the insert.
            let mut state = self.shared.state();
            if *state != MonitorState::Starting {
                drop(state);
                let reason = self
                    .shared
                    .take_startup_failure()
                    .unwrap_or_else(|| "watcher stopped during start".to_string());
                return Err(Error::WatcherInit(reason));
            }

            let live = std::mem::take(&mut *self.shared.startup_events());
            for record in devices {
                if live.contains_key(record.key()) {
                    debug!("Keeping live state for {} over enumeration", record.key());
                    continue;
                }
                self.shared.registry.insert(record);
            }

            *state = MonitorState::Running;
            self.shared.bridge.open_session();
        }

        guard.armed = false;
        *slot = Some(subscription);
        info!(
            "Monitoring started with {} devices",
            self.shared.registry.len()
        );
        Ok(())
    }

    /// Stop monitoring
    ///
    /// Ends the notification session, releases the watcher subscription and
    /// clears the registry without raising removed notifications. Once this
    /// returns no handler call of the ended session is running or will run.
    /// A no-op when already stopped.
    ///
    /// Handlers may call `stop` themselves. A handler must not call it while
    /// another thread is stopping the same monitor.
    pub fn stop(&self) -> Result<()> {
        let mut slot = self.lifecycle();

        let was_running = {
            let mut state = self.shared.state();
            match *state {
                MonitorState::Running | MonitorState::Starting => {
                    *state = MonitorState::Stopping;
                    self.shared.bridge.end_session();
                    true
                }
                MonitorState::Stopped | MonitorState::Stopping => false,
            }
        };

        if let Some(subscription) = slot.take() {
            subscription.unsubscribe();
        }

        if !was_running {
            debug!("Monitoring not running");
            return Ok(());
        }

        self.shared.bridge.wait_idle();
        let cleared = self.shared.registry.clear();
        *self.shared.state() = MonitorState::Stopped;
        info!("Monitoring stopped, {} devices forgotten", cleared);
        Ok(())
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Devices currently known to the monitor that match `filter`
    ///
    /// Empty while monitoring is stopped.
    pub fn devices(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.shared.registry.snapshot(filter)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MonitorController {
    fn drop(&mut self) {
        if self.is_running() {
            info!("Stopping monitoring on shutdown");
        }
        if let Err(e) = self.stop() {
            warn!("Failed to stop monitoring on drop: {}", e);
        }
    }
}
