//! Test utilities for usb-detection
//!
//! Provides mock records and helpers for observing deliveries that happen on
//! other threads.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_record;
//!
//! # fn main() {
//! let device = create_mock_record(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id(), 0x1234);
//! # }
//! ```

use crate::record::{DeviceKey, DeviceRecord};
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Key used by [`create_mock_record`] for a given id
pub fn mock_key(id: u32) -> DeviceKey {
    DeviceKey::new(format!("usb-001-{:03}", id))
}

/// Create a mock DeviceRecord for testing
///
/// # Example
/// ```
/// use common::test_utils::{create_mock_record, mock_key};
///
/// let device = create_mock_record(7, 0x1234, 0x5678);
/// assert_eq!(device.key(), &mock_key(7));
/// assert_eq!(device.serial_number(), "SN000007");
/// ```
pub fn create_mock_record(id: u32, vendor_id: u16, product_id: u16) -> DeviceRecord {
    DeviceRecord::builder(mock_key(id), vendor_id, product_id)
        .location_id(0x0100_0000 | (id << 20))
        .device_address(id)
        .device_name(format!("Test Product {}", id))
        .manufacturer(format!("Test Manufacturer {}", id))
        .serial_number(format!("SN{:06}", id))
        .build()
}

/// Create a list of mock records with distinct ids
pub fn create_mock_record_list(count: u32) -> Vec<DeviceRecord> {
    (1..=count)
        .map(|i| create_mock_record(i, 0x1000 + (i as u16), 0x2000 + (i as u16)))
        .collect()
}

/// Collects events delivered on another thread
///
/// Each entry is a `(label, record)` pair so one recorder can observe
/// several handler kinds and keep their relative order.
#[derive(Clone, Default)]
pub struct EventRecorder {
    inner: Arc<(Mutex<Vec<(String, DeviceRecord)>>, Condvar)>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a handler closure that records under `label`
    pub fn handler(&self, label: &str) -> impl Fn(&DeviceRecord) + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        let label = label.to_string();
        move |record: &DeviceRecord| {
            let (events, cvar) = &*inner;
            events
                .lock()
                .unwrap()
                .push((label.clone(), record.clone()));
            cvar.notify_all();
        }
    }

    pub fn events(&self) -> Vec<(String, DeviceRecord)> {
        self.inner.0.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events().into_iter().map(|(label, _)| label).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least `count` events were recorded
    ///
    /// Returns false on timeout.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (events, cvar) = &*self.inner;
        let mut guard = events.lock().unwrap();
        while guard.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = cvar.wait_timeout(guard, deadline - now).unwrap().0;
        }
        true
    }
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_record_list_is_distinct() {
        let list = create_mock_record_list(4);
        assert_eq!(list.len(), 4);
        for (i, a) in list.iter().enumerate() {
            for b in &list[i + 1..] {
                assert_ne!(a.key(), b.key());
            }
        }
    }

    #[test]
    fn test_recorder_waits_for_other_thread() {
        let recorder = EventRecorder::new();
        let handler = recorder.handler("added");

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handler(&create_mock_record(1, 1, 1));
        });

        assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
        assert_eq!(recorder.labels(), vec!["added".to_string()]);
        handle.join().unwrap();
    }

    #[test]
    fn test_recorder_times_out() {
        let recorder = EventRecorder::new();
        assert!(!recorder.wait_for(1, Duration::from_millis(10)));
        assert!(recorder.is_empty());
    }
}
