//! Notification bridge
//!
//! Carries device notifications from the watcher's notification thread to
//! consumer handlers. Producers enqueue on an unbounded FIFO and return
//! immediately; a single `usb-notify` dispatch thread drains the queue and
//! calls the handler registered at dispatch time. One queue and one
//! dispatcher keep events for the same device in the order they happened.
//!
//! Notifications belong to a session (one `start`..`stop` span of the
//! monitor). Closing the session drops everything still queued for it and
//! waits for a handler call already in progress.

use async_channel::{Receiver, Sender};
use common::{DeviceRecord, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, error, warn};

/// Handler for added/removed device notifications
pub type DeviceHandler = Arc<dyn Fn(&DeviceRecord) + Send + Sync>;

/// Handler for monitoring failures
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Kind of device notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Added,
    Removed,
}

/// Queued notification
#[derive(Debug)]
enum Notification {
    Device {
        session: u64,
        kind: NotificationKind,
        record: DeviceRecord,
    },
    Failed {
        message: String,
    },
}

#[derive(Default)]
struct Handlers {
    added: Option<DeviceHandler>,
    removed: Option<DeviceHandler>,
    error: Option<ErrorHandler>,
}

#[derive(Debug, Default)]
struct Session {
    id: u64,
    open: bool,
}

#[derive(Default)]
struct Shared {
    handlers: Mutex<Handlers>,
    session: Mutex<Session>,
    /// Held by the dispatcher for the duration of one handler call
    in_flight: Mutex<()>,
}

impl Shared {
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, session: u64) -> bool {
        let current = self.session();
        current.open && current.id == session
    }
}

/// Cross-thread delivery of device notifications to consumer handlers
pub struct NotificationBridge {
    shared: Arc<Shared>,
    tx: Sender<Notification>,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_id: ThreadId,
}

impl NotificationBridge {
    /// Create the bridge and spawn its dispatch thread
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = async_channel::unbounded();

        let dispatcher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("usb-notify".to_string())
                .spawn(move || run_dispatcher(shared, rx))?
        };
        let dispatcher_id = dispatcher.thread().id();

        Ok(Self {
            shared,
            tx,
            dispatcher: Some(dispatcher),
            dispatcher_id,
        })
    }

    /// Set the handler for added devices, replacing any previous one
    pub fn register_added(&self, handler: impl Fn(&DeviceRecord) + Send + Sync + 'static) {
        self.shared.handlers().added = Some(Arc::new(handler));
        debug!("Added handler registered");
    }

    /// Set the handler for removed devices, replacing any previous one
    pub fn register_removed(&self, handler: impl Fn(&DeviceRecord) + Send + Sync + 'static) {
        self.shared.handlers().removed = Some(Arc::new(handler));
        debug!("Removed handler registered");
    }

    /// Set the handler for monitoring failures, replacing any previous one
    pub fn register_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.handlers().error = Some(Arc::new(handler));
        debug!("Error handler registered");
    }

    pub fn clear_handlers(&self) {
        *self.shared.handlers() = Handlers::default();
    }

    /// Begin a new delivery session; returns its id
    pub fn open_session(&self) -> u64 {
        let mut session = self.shared.session();
        session.id += 1;
        session.open = true;
        debug!("Notification session {} opened", session.id);
        session.id
    }

    /// End the current session and wait for an in-flight handler call
    ///
    /// Queued notifications of the session are dropped.
    pub fn close_session(&self) {
        if self.end_session() {
            self.wait_idle();
        }
    }

    /// Mark the current session closed without waiting
    ///
    /// Returns false if no session was open.
    pub fn end_session(&self) -> bool {
        let mut session = self.shared.session();
        if !session.open {
            return false;
        }
        session.open = false;
        debug!("Notification session {} closed", session.id);
        true
    }

    /// Wait until no handler call is running
    ///
    /// Returns immediately on the dispatch thread itself, where the caller
    /// is the running handler.
    pub fn wait_idle(&self) {
        if std::thread::current().id() == self.dispatcher_id {
            return;
        }
        drop(
            self.shared
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    pub fn is_open(&self) -> bool {
        self.shared.session().open
    }

    /// Queue a device notification for the current session
    ///
    /// Never blocks. Returns false when no session is open and the
    /// notification was dropped.
    pub fn deliver(&self, kind: NotificationKind, record: DeviceRecord) -> bool {
        let session = {
            let session = self.shared.session();
            if !session.open {
                debug!("No open session, dropping {:?} for {}", kind, record.key());
                return false;
            }
            session.id
        };

        self.enqueue(Notification::Device {
            session,
            kind,
            record,
        })
    }

    /// Queue a monitoring failure; delivered regardless of session state
    pub fn deliver_failure(&self, message: impl Into<String>) -> bool {
        self.enqueue(Notification::Failed {
            message: message.into(),
        })
    }

    fn enqueue(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to queue notification: {}", e);
                false
            }
        }
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.tx.close();
        if let Some(dispatcher) = self.dispatcher.take() {
            if std::thread::current().id() == self.dispatcher_id {
                return;
            }
            if let Err(e) = dispatcher.join() {
                error!("Notification dispatcher panicked: {:?}", e);
            }
        }
    }
}

fn run_dispatcher(shared: Arc<Shared>, rx: Receiver<Notification>) {
    debug!("Notification dispatcher started");

    while let Ok(notification) = rx.recv_blocking() {
        let _in_flight = shared
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match notification {
            Notification::Device {
                session,
                kind,
                record,
            } => {
                if !shared.is_current(session) {
                    debug!(
                        "Dropping {:?} for {} from closed session {}",
                        kind,
                        record.key(),
                        session
                    );
                    continue;
                }

                let handler = {
                    let handlers = shared.handlers();
                    match kind {
                        NotificationKind::Added => handlers.added.clone(),
                        NotificationKind::Removed => handlers.removed.clone(),
                    }
                };

                match handler {
                    Some(handler) => invoke(|| handler(&record)),
                    None => debug!("No {:?} handler registered for {}", kind, record.key()),
                }
            }
            Notification::Failed { message } => {
                let handler = shared.handlers().error.clone();
                match handler {
                    Some(handler) => invoke(|| handler(&message)),
                    None => warn!("Monitoring failed with no error handler: {}", message),
                }
            }
        }
    }

    debug!("Notification dispatcher stopped");
}

// A panicking handler must not take the dispatch thread down.
fn invoke(call: impl FnOnce()) {
    if let Err(e) = catch_unwind(AssertUnwindSafe(call)) {
        error!("Panic in notification handler: {:?}", e);
    }
}
