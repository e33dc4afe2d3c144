//! Monitoring integration tests
//!
//! Drives the `UsbDetection` facade against the simulated watcher:
//! - Initial enumeration and find consistency
//! - Attach/detach delivery and ordering
//! - Lifecycle idempotency and clean stop
//! - Start and mid-stream failures
//!
//! Run with: `cargo test -p detection --test monitor_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, EventRecorder, create_mock_record, create_mock_record_list, mock_key,
    with_timeout,
};
use common::{DeviceFilter, Error};
use detection::{SimulatedWatcher, UsbDetection, WatcherEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

fn setup(initial: u32) -> (SimulatedWatcher, UsbDetection, EventRecorder) {
    let watcher = SimulatedWatcher::with_devices(create_mock_record_list(initial));
    let usb = UsbDetection::new(Arc::new(watcher.clone())).unwrap();
    let recorder = EventRecorder::new();
    usb.register_added(recorder.handler("add"));
    usb.register_removed(recorder.handler("remove"));
    (watcher, usb, recorder)
}

// ============================================================================
// Start
// ============================================================================

#[test]
fn test_no_added_events_for_initial_devices() {
    let (watcher, usb, recorder) = setup(3);
    usb.start_monitoring().unwrap();

    // A live attach after start is the only add delivered
    watcher.plug(create_mock_record(42, 0xdead, 0xbeef));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    std::thread::sleep(Duration::from_millis(50));

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.key(), &mock_key(42));
    assert_eq!(usb.devices().len(), 4);
}

#[tokio::test]
async fn test_find_after_start_returns_every_device() {
    let (_watcher, usb, _recorder) = setup(5);
    usb.start_monitoring().unwrap();

    let found = with_timeout(DEFAULT_TEST_TIMEOUT, usb.find(DeviceFilter::any()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(found, usb.devices());
    assert_eq!(found.len(), 5);
}

#[test]
fn test_double_start_is_idempotent() {
    let (watcher, usb, _recorder) = setup(2);

    usb.start_monitoring().unwrap();
    usb.start_monitoring().unwrap();

    assert_eq!(watcher.subscribe_count(), 1);
    assert_eq!(watcher.active_subscriptions(), 1);
    assert_eq!(usb.devices().len(), 2);
}

#[test]
fn test_failed_start_rolls_back() {
    let (watcher, usb, recorder) = setup(2);
    watcher.fail_next_subscribe("access denied");

    match usb.start_monitoring() {
        Err(Error::WatcherInit(message)) => assert_eq!(message, "access denied"),
        other => panic!("unexpected start result: {:?}", other),
    }
    assert!(!usb.is_monitoring());
    assert!(usb.devices().is_empty());
    assert_eq!(watcher.active_subscriptions(), 0);

    // Nothing leaks into a later session
    usb.start_monitoring().unwrap();
    watcher.plug(create_mock_record(7, 0x0001, 0x0001));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    assert_eq!(recorder.len(), 1);
}

#[test]
fn test_unplug_during_start_leaves_no_stale_device() {
    let (watcher, usb, recorder) = setup(2);
    watcher.during_next_enumerate(WatcherEvent::Detached(mock_key(1)));

    usb.start_monitoring().unwrap();
    let keys: Vec<_> = usb.devices().iter().map(|r| r.key().clone()).collect();
    assert_eq!(keys, vec![mock_key(2)]);

    // Plugging it back in is a real add
    watcher.plug(create_mock_record(1, 0x1001, 0x2001));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    assert_eq!(recorder.labels(), vec!["add"]);
    assert_eq!(recorder.events()[0].1.key(), &mock_key(1));
    assert_eq!(usb.devices().len(), 2);
}

#[test]
fn test_plug_during_start_is_listed_without_add() {
    let (watcher, usb, recorder) = setup(1);
    watcher.during_next_enumerate(WatcherEvent::Attached(create_mock_record(
        5, 0x0005, 0x0005,
    )));

    usb.start_monitoring().unwrap();
    assert_eq!(usb.devices().len(), 2);

    watcher.unplug(&mock_key(5));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    assert_eq!(recorder.labels(), vec!["remove"]);
}

#[test]
fn test_watcher_failure_during_start_rolls_back() {
    let (watcher, usb, recorder) = setup(3);
    watcher.during_next_enumerate(WatcherEvent::Failed("hub reset".to_string()));

    match usb.start_monitoring() {
        Err(Error::WatcherInit(message)) => assert_eq!(message, "hub reset"),
        other => panic!("unexpected start result: {:?}", other),
    }
    assert!(!usb.is_monitoring());
    assert!(usb.devices().is_empty());
    assert_eq!(watcher.active_subscriptions(), 0);

    usb.start_monitoring().unwrap();
    assert!(usb.is_monitoring());
    assert_eq!(usb.devices().len(), 3);
    watcher.plug(create_mock_record(9, 9, 9));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    assert_eq!(recorder.len(), 1);
}

// ============================================================================
// Live events
// ============================================================================

#[tokio::test]
async fn test_detach_delivers_the_found_record() {
    let (watcher, usb, recorder) = setup(3);
    usb.start_monitoring().unwrap();

    let found = usb.find(DeviceFilter::any()).await.unwrap();
    let target = found[1].clone();

    assert!(watcher.unplug(target.key()));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "remove");
    assert_eq!(events[0].1, target);
    assert!(usb.devices().iter().all(|r| r.key() != target.key()));
}

#[test]
fn test_attach_detach_attach_in_order() {
    let (watcher, usb, recorder) = setup(0);
    usb.start_monitoring().unwrap();

    watcher.plug(create_mock_record(1, 0x1234, 0x0001));
    watcher.unplug(&mock_key(1));
    watcher.plug(create_mock_record(1, 0x1234, 0x0002));

    assert!(recorder.wait_for(3, DEFAULT_TEST_TIMEOUT));
    assert_eq!(recorder.labels(), vec!["add", "remove", "add"]);
    assert_eq!(recorder.events()[2].1.product_id(), 0x0002);
}

#[test]
fn test_reattach_of_known_key_is_not_reported() {
    let (watcher, usb, recorder) = setup(1);
    usb.start_monitoring().unwrap();

    watcher.plug(create_mock_record(1, 0x1001, 0x2001));
    watcher.plug(create_mock_record(2, 0x1002, 0x2002));

    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.events()[0].1.key(), &mock_key(2));
}

#[test]
fn test_detach_of_unknown_key_is_silent() {
    let (watcher, usb, recorder) = setup(1);
    usb.start_monitoring().unwrap();

    watcher.emit(WatcherEvent::Detached(mock_key(99)));
    watcher.unplug(&mock_key(1));

    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.labels(), vec!["remove"]);
}

#[test]
fn test_handlers_persist_across_deliveries() {
    let (watcher, usb, recorder) = setup(0);
    usb.start_monitoring().unwrap();

    for id in 1..=10 {
        watcher.plug(create_mock_record(id, 0x1000, id as u16));
    }
    for id in 1..=10 {
        watcher.unplug(&mock_key(id));
    }

    assert!(recorder.wait_for(20, DEFAULT_TEST_TIMEOUT));
    let labels = recorder.labels();
    assert_eq!(labels.iter().filter(|l| *l == "add").count(), 10);
    assert_eq!(labels.iter().filter(|l| *l == "remove").count(), 10);
}

#[test]
fn test_handlers_run_on_dispatch_thread() {
    let (watcher, usb, _recorder) = setup(0);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    usb.register_added(move |_| {
        let name = std::thread::current().name().map(str::to_string);
        tx.lock().unwrap().send(name).unwrap();
    });
    usb.start_monitoring().unwrap();

    watcher.plug(create_mock_record(1, 1, 1));
    let name = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(name.as_deref(), Some("usb-notify"));
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn test_find_filter_is_subset_of_unfiltered() {
    let watcher = SimulatedWatcher::with_devices(vec![
        create_mock_record(1, 0x046d, 0xc52b),
        create_mock_record(2, 0x046d, 0xc077),
        create_mock_record(3, 0x0781, 0x5581),
        create_mock_record(4, 0x05ac, 0x12a8),
    ]);
    let usb = UsbDetection::new(Arc::new(watcher)).unwrap();

    let all = usb.find(DeviceFilter::any()).await.unwrap();
    let logitech = usb.find(DeviceFilter::vendor(0x046d)).await.unwrap();
    let exact = usb
        .find(DeviceFilter::new(Some(0x0781), Some(0x5581)))
        .await
        .unwrap();

    assert_eq!(all.len(), 4);
    assert_eq!(logitech.len(), 2);
    assert!(logitech.iter().all(|r| all.contains(r)));
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].key(), &mock_key(3));

    // find never starts monitoring
    assert!(!usb.is_monitoring());
}

// ============================================================================
// Stop
// ============================================================================

#[test]
fn test_no_deliveries_after_stop() {
    let (watcher, usb, recorder) = setup(2);
    watcher.set_leaky(true);
    usb.start_monitoring().unwrap();
    usb.stop_monitoring().unwrap();

    // The platform keeps firing into the released subscription
    watcher.plug(create_mock_record(10, 0x1000, 0x0010));
    watcher.unplug(&mock_key(1));
    std::thread::sleep(Duration::from_millis(100));

    assert!(recorder.is_empty());
    assert!(usb.devices().is_empty());
    assert!(!usb.is_monitoring());
}

#[test]
fn test_stop_waits_for_running_handler() {
    let (watcher, usb, _recorder) = setup(0);
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);
    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        usb.register_added(move |_| {
            started_tx.lock().unwrap().send(()).unwrap();
            std::thread::sleep(Duration::from_millis(100));
            finished.store(true, Ordering::SeqCst);
        });
    }
    usb.start_monitoring().unwrap();

    watcher.plug(create_mock_record(1, 1, 1));
    started_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    usb.stop_monitoring().unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_stop_from_inside_handler() {
    let watcher = SimulatedWatcher::new();
    let usb = Arc::new(UsbDetection::new(Arc::new(watcher.clone())).unwrap());
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    {
        let weak = Arc::downgrade(&usb);
        usb.register_added(move |_| {
            if let Some(usb) = weak.upgrade() {
                let result = usb.stop_monitoring();
                tx.lock().unwrap().send(result.is_ok()).unwrap();
            }
        });
    }
    usb.start_monitoring().unwrap();

    watcher.plug(create_mock_record(1, 1, 1));
    assert!(rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap());
    assert!(!usb.is_monitoring());
    assert_eq!(watcher.active_subscriptions(), 0);
}

#[test]
fn test_restart_after_stop() {
    let (watcher, usb, recorder) = setup(2);
    usb.start_monitoring().unwrap();
    usb.stop_monitoring().unwrap();
    usb.start_monitoring().unwrap();

    assert_eq!(watcher.subscribe_count(), 2);
    assert_eq!(watcher.active_subscriptions(), 1);
    assert_eq!(usb.devices().len(), 2);

    watcher.plug(create_mock_record(3, 3, 3));
    assert!(recorder.wait_for(1, DEFAULT_TEST_TIMEOUT));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_mid_stream_failure_degrades_to_stopped() {
    let (watcher, usb, recorder) = setup(2);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    usb.register_error(move |message| {
        tx.lock().unwrap().send(message.to_string()).unwrap();
    });
    usb.start_monitoring().unwrap();

    watcher.fail("hot-plug thread died");
    let message = rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(message, "hot-plug thread died");
    assert!(!usb.is_monitoring());
    assert!(usb.devices().is_empty());

    // Events from the dead stream are ignored
    watcher.plug(create_mock_record(5, 5, 5));
    std::thread::sleep(Duration::from_millis(50));
    assert!(recorder.is_empty());

    // A fresh start recovers
    usb.start_monitoring().unwrap();
    assert_eq!(watcher.active_subscriptions(), 1);
    assert_eq!(usb.devices().len(), 3);
}

#[tokio::test]
async fn test_find_enumeration_failure_has_no_partial_results() {
    let (watcher, usb, _recorder) = setup(3);
    watcher.fail_enumeration(Some("libusb busy"));

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, usb.find(DeviceFilter::any()))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Enumeration(_))));
}
